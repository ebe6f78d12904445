//! Drive the worker's command loop end to end with a scripted engine
//!
//! These tests cover the protocol contract, on-demand initialization and the
//! reclamation cadence without FunASR or real model files.


use std::sync::atomic::Ordering;
use std::sync::Arc;

use approx::assert_relative_eq;
use ququ_engine::ModelKind;
use ququ_worker::protocol::{write_startup, INIT_SENTINEL};
use ququ_worker::Worker;
use serde_json::json;
use tempfile::TempDir;
use test_helpers::*;

/// Worker over a populated model tree, already initialized
async fn ready_worker(
    engine: FakeEngine,
    cleanup_interval: u64,
) -> (Worker, Arc<FakeEngine>, TempDir) {
    let engine = Arc::new(engine);
    let root = model_tree(true);
    let mut worker = worker(engine.clone(), root.path(), cleanup_interval);
    let init = worker.startup().await;
    assert!(init.success, "{:?}", init);
    (worker, engine, root)
}

#[tokio::test]
async fn test_startup_then_status() {
    let (mut worker, engine, _root) = ready_worker(FakeEngine::new(), 10).await;
    assert_eq!(engine.loads(), 3);

    let replies = drive(&mut worker, &[command("status")]).await;
    assert_eq!(
        replies[0],
        json!({
            "success": true,
            "installed": true,
            "initialized": true,
            "version": "1.1.6",
            "models": {"asr": true, "vad": true, "punc": true}
        })
    );
}

#[tokio::test]
async fn test_startup_result_follows_sentinel() {
    let (mut worker, _engine, _root) = ready_worker(FakeEngine::new(), 10).await;
    let init = worker.startup().await;

    let mut out = Vec::new();
    write_startup(&mut out, &init).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    let mut lines = text.lines();

    assert_eq!(lines.next(), Some(INIT_SENTINEL));
    let result: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(lines.next(), None);
}

#[tokio::test]
async fn test_malformed_lines_keep_loop_alive() {
    let (mut worker, _engine, _root) = ready_worker(FakeEngine::new(), 10).await;

    let replies = drive(
        &mut worker,
        &[
            "{not json".to_string(),
            String::new(),
            "\"just a string\"".to_string(),
            command("stats"),
        ],
    )
    .await;

    assert_eq!(replies.len(), 3, "blank line gets no reply");
    for reply in &replies[..2] {
        assert_eq!(*reply, json!({"success": false, "error": "invalid JSON command"}));
    }
    assert_eq!(replies[2]["success"], true);
}

#[tokio::test]
async fn test_unknown_action() {
    let (mut worker, _engine, _root) = ready_worker(FakeEngine::new(), 10).await;

    let replies = drive(&mut worker, &[command("dance"), command("cleanup")]).await;
    assert_eq!(
        replies[0],
        json!({"success": false, "error": "unknown command: dance"})
    );
    assert_eq!(
        replies[1],
        json!({"success": true, "message": "memory cleanup completed"})
    );
}

#[tokio::test]
async fn test_exit_ignores_queued_input() {
    let (mut worker, _engine, _root) = ready_worker(FakeEngine::new(), 10).await;

    let replies = drive(
        &mut worker,
        &[command("exit"), command("stats"), command("status")],
    )
    .await;

    assert_eq!(replies, vec![json!({"success": true, "message": "server exiting"})]);
    assert!(!worker.state().running.is_running());
}

#[tokio::test]
async fn test_missing_audio_invokes_nothing() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let missing = root.path().join("nope.wav");

    let replies = drive(&mut worker, &[transcribe(&missing, None)]).await;
    assert_eq!(replies[0]["success"], false);
    assert_eq!(replies[0]["type"], "transcription_error");
    assert!(replies[0]["error"]
        .as_str()
        .unwrap()
        .contains(&*missing.to_string_lossy()));

    assert_eq!(engine.counters.capability_calls(), 0);
    assert_eq!(worker.state().transcription_count, 0);
}

#[tokio::test]
async fn test_transcription_result_shape() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "hello.wav", 1.0);

    let replies = drive(&mut worker, &[transcribe(&wav, None)]).await;
    let reply = &replies[0];
    assert_eq!(reply["success"], true);
    assert_eq!(reply["raw_text"], RECOGNIZED);
    assert_eq!(reply["text"], format!("{}。", RECOGNIZED));
    assert_eq!(reply["confidence"], 0.0);
    assert_relative_eq!(reply["duration"].as_f64().unwrap(), 1.0, epsilon = 1e-6);
    assert_eq!(reply["language"], "zh-CN");
    assert_eq!(reply["model_type"], "pytorch");

    assert_eq!(engine.counters.vad_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.counters.asr_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.counters.punc_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_options_disable_vad_and_punctuation() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "plain.wav", 0.5);

    let replies = drive(
        &mut worker,
        &[transcribe(
            &wav,
            Some(json!({"use_vad": false, "use_punc": false, "hotword": "天气"})),
        )],
    )
    .await;

    assert_eq!(replies[0]["success"], true);
    assert_eq!(replies[0]["text"], replies[0]["raw_text"]);
    assert_eq!(engine.counters.vad_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.counters.punc_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fractional_batch_size_reaches_recognizer() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "a.wav", 0.5);

    let replies = drive(
        &mut worker,
        &[
            transcribe(&wav, Some(json!({"batch_size_s": 30.5}))),
            transcribe(&wav, Some(json!({"batch_size_s": 60.0}))),
        ],
    )
    .await;

    assert_eq!(replies[0]["success"], true);
    assert_eq!(replies[1]["success"], true);
    assert_eq!(*engine.counters.last_batch_size.lock().unwrap(), Some(60.0));
}

#[tokio::test]
async fn test_bad_option_type_is_transcription_error() {
    let (mut worker, _engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "a.wav", 0.5);

    let replies = drive(
        &mut worker,
        &[transcribe(&wav, Some(json!({"batch_size_s": "lots"}))), command("stats")],
    )
    .await;

    assert_eq!(replies[0]["success"], false);
    assert_eq!(replies[0]["type"], "transcription_error");
    assert_eq!(replies[1]["stats"]["transcription_count"], 0);
}

#[tokio::test]
async fn test_punctuation_failure_falls_back_to_raw_text() {
    let (mut worker, engine, root) =
        ready_worker(FakeEngine::new().failing_punctuation(), 10).await;
    let wav = write_wav(root.path(), "a.wav", 1.0);

    let replies = drive(&mut worker, &[transcribe(&wav, None)]).await;
    assert_eq!(replies[0]["success"], true);
    assert_eq!(replies[0]["text"], RECOGNIZED);
    assert_eq!(replies[0]["raw_text"], RECOGNIZED);
    assert_eq!(engine.counters.punc_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reclaim_every_tenth_transcription() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "a.wav", 0.1);
    let line = transcribe(&wav, None);

    let mut reclaims_after = Vec::new();
    for _ in 0..25 {
        let replies = drive(&mut worker, &[line.clone()]).await;
        assert_eq!(replies[0]["success"], true);
        reclaims_after.push(engine.reclaims());
    }

    for (i, &reclaims) in reclaims_after.iter().enumerate() {
        let count = i + 1;
        assert_eq!(reclaims, count / 10, "after {} transcriptions", count);
    }
    assert_eq!(worker.reclaimer().passes(), 2);
}

#[tokio::test]
async fn test_stats_average() {
    let (mut worker, _engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let lines = vec![
        transcribe(&write_wav(root.path(), "one.wav", 1.0), None),
        transcribe(&write_wav(root.path(), "two.wav", 2.0), None),
        transcribe(&write_wav(root.path(), "half.wav", 0.5), None),
        command("stats"),
    ];

    let replies = drive(&mut worker, &lines).await;
    let stats = &replies[3]["stats"];
    assert_eq!(replies[3]["success"], true);
    assert_eq!(stats["transcription_count"], 3);
    assert_relative_eq!(stats["total_audio_duration"].as_f64().unwrap(), 3.5);
    assert_relative_eq!(stats["average_duration"].as_f64().unwrap(), 1.17);
    assert_eq!(stats["initialized"], true);
    assert_eq!(stats["models_loaded"], json!({"asr": true, "vad": true, "punc": true}));
}

#[tokio::test]
async fn test_unknown_duration_counts_without_adding_time() {
    let (mut worker, _engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let odd = root.path().join("clip.xyz");
    std::fs::write(&odd, b"not audio").unwrap();

    let replies = drive(&mut worker, &[transcribe(&odd, None), command("stats")]).await;
    assert_eq!(replies[0]["success"], true);
    assert_eq!(replies[0]["duration"], 0.0);
    assert_eq!(replies[1]["stats"]["transcription_count"], 1);
    assert_eq!(replies[1]["stats"]["total_audio_duration"], 0.0);
}

#[tokio::test]
async fn test_stats_before_any_transcription() {
    let (mut worker, _engine, _root) = ready_worker(FakeEngine::new(), 10).await;

    let replies = drive(&mut worker, &[command("stats")]).await;
    assert_eq!(replies[0]["stats"]["transcription_count"], 0);
    assert_eq!(replies[0]["stats"]["average_duration"], 0.0);
}

#[tokio::test]
async fn test_initialization_is_not_repeated() {
    let (mut worker, engine, root) = ready_worker(FakeEngine::new(), 10).await;
    let wav = write_wav(root.path(), "a.wav", 0.2);

    drive(&mut worker, &[transcribe(&wav, None), transcribe(&wav, None)]).await;
    assert_eq!(engine.loads(), 3);
}

#[tokio::test]
async fn test_models_not_downloaded_then_retry() {
    let engine = Arc::new(FakeEngine::new());
    let root = model_tree(false);
    let mut worker = worker(engine.clone(), root.path(), 10);

    let init = worker.startup().await;
    let init = serde_json::to_value(&init).unwrap();
    assert_eq!(init["success"], false);
    assert_eq!(init["type"], "models_not_downloaded");

    let wav = write_wav(root.path(), "a.wav", 0.5);
    let replies = drive(&mut worker, &[transcribe(&wav, None), transcribe(&wav, None)]).await;
    for reply in &replies {
        assert_eq!(*reply, init, "on-demand initialization fails the same way");
    }

    assert_eq!(engine.loads(), 0);
    assert_eq!(engine.counters.capability_calls(), 0);
    assert!(!worker.state().initialized);
}

#[tokio::test]
async fn test_failed_load_is_retried_by_transcribe() {
    let engine = Arc::new(FakeEngine::new().failing_load(ModelKind::Vad));
    let root = model_tree(true);
    let mut worker = worker(engine.clone(), root.path(), 10);

    let init = worker.startup().await;
    assert!(!init.success);
    assert_eq!(init.error.as_deref(), Some("models failed: vad"));

    let wav = write_wav(root.path(), "a.wav", 0.5);
    let replies = drive(&mut worker, &[transcribe(&wav, None), command("status")]).await;
    assert_eq!(replies[0]["type"], "init_error");
    assert_eq!(engine.loads(), 6, "transcribe reloaded all three");

    assert_eq!(replies[1]["initialized"], false);
    assert_eq!(
        replies[1]["models"],
        json!({"asr": true, "vad": false, "punc": true})
    );
}

#[tokio::test]
async fn test_missing_library() {
    let engine = Arc::new(FakeEngine::new().not_installed());
    let root = model_tree(true);
    let mut worker = worker(engine.clone(), root.path(), 10);

    let init = worker.startup().await;
    assert!(!init.success);
    assert_eq!(
        serde_json::to_value(&init).unwrap()["type"],
        "import_error"
    );

    let replies = drive(&mut worker, &[command("status")]).await;
    assert_eq!(replies[0]["success"], false);
    assert_eq!(replies[0]["installed"], false);
    assert_eq!(replies[0]["initialized"], false);
    assert_eq!(engine.loads(), 0);
}
