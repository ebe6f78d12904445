//! Transcription pipeline: (init) → VAD → ASR → punctuation → result

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use ququ_engine::{AsrParams, AudioDurationProbe};

use crate::lifecycle::ModelLifecycle;
use crate::protocol::{ErrorKind, Outcome, Response, TranscriptionResult};
use crate::reclaim::ResourceReclaimer;
use crate::state::ServerState;

/// Reported language of every result
pub const RESULT_LANGUAGE: &str = "zh-CN";

/// Reported model flavour of every result
pub const RESULT_MODEL_TYPE: &str = "pytorch";

/// Per-request options; request values override these defaults key by key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionOptions {
    /// Any JSON number; fractional values are passed through as-is
    pub batch_size_s: f64,
    pub hotword: String,
    pub use_vad: bool,
    pub use_punc: bool,
    /// Accepted for compatibility; results are always reported as zh-CN
    pub language: String,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            batch_size_s: 60.0,
            hotword: String::new(),
            use_vad: true,
            use_punc: true,
            language: "zh".to_string(),
        }
    }
}

impl TranscriptionOptions {
    /// Overlay request options on top of `self`.
    ///
    /// Unknown keys are ignored and `null` values leave the default in place.
    pub fn merged(&self, overrides: Option<&Map<String, Value>>) -> serde_json::Result<Self> {
        let mut base = serde_json::to_value(self)?;

        if let (Value::Object(base), Some(overrides)) = (&mut base, overrides) {
            for (key, value) in overrides {
                if !value.is_null() {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        serde_json::from_value(base)
    }
}

/// Runs one transcription request end to end
pub struct TranscriptionPipeline {
    lifecycle: Arc<ModelLifecycle>,
    reclaimer: Arc<ResourceReclaimer>,
    probe: Arc<dyn AudioDurationProbe>,
    defaults: TranscriptionOptions,
    cleanup_interval: u64,
}

impl TranscriptionPipeline {
    pub fn new(
        lifecycle: Arc<ModelLifecycle>,
        reclaimer: Arc<ResourceReclaimer>,
        probe: Arc<dyn AudioDurationProbe>,
        defaults: TranscriptionOptions,
        cleanup_interval: u64,
    ) -> Self {
        Self {
            lifecycle,
            reclaimer,
            probe,
            defaults,
            cleanup_interval,
        }
    }

    /// Transcribe `audio_path`.
    ///
    /// Initializes models on demand and returns the initialization failure
    /// verbatim if that does not work. Every other failure becomes a
    /// `transcription_error` response.
    pub async fn transcribe(
        &self,
        state: &mut ServerState,
        audio_path: Option<&str>,
        options: Option<&Map<String, Value>>,
    ) -> Response {
        if !state.initialized {
            let init = self.lifecycle.initialize(state).await;
            if !init.success {
                return init.into();
            }
        }

        let path = PathBuf::from(audio_path.unwrap_or_default());
        if !path.exists() {
            warn!("Audio file not found: {}", path.display());
            return Outcome::failure(
                ErrorKind::TranscriptionError,
                format!("audio file not found: {}", path.display()),
            )
            .into();
        }

        match self.run(state, &path, options).await {
            Ok(result) => Response::Transcription(result),
            Err(e) => {
                error!("Transcription of {} failed: {:?}", path.display(), e);
                Outcome::failure(
                    ErrorKind::TranscriptionError,
                    format!("audio transcription failed: {:#}", e),
                )
                .into()
            }
        }
    }

    async fn run(
        &self,
        state: &mut ServerState,
        path: &Path,
        overrides: Option<&Map<String, Value>>,
    ) -> Result<TranscriptionResult> {
        info!("Transcribing {}", path.display());

        let options = self
            .defaults
            .merged(overrides)
            .context("invalid transcription options")?;
        let models = state.models.clone();

        if options.use_vad {
            let vad = models.vad.ok_or_else(|| anyhow!("VAD model not loaded"))?;
            let audio = path.to_path_buf();
            let batch_size_s = options.batch_size_s;
            // Segments are informational; ASR still sees the whole file
            let segments = run_blocking(move || vad.detect(&audio, batch_size_s)).await?;
            info!("VAD done: {} speech segments", segments.len());
        }

        let asr = models.asr.ok_or_else(|| anyhow!("ASR model not loaded"))?;
        let audio = path.to_path_buf();
        let params = AsrParams {
            batch_size_s: options.batch_size_s,
            hotword: options.hotword.clone(),
        };
        let recognition = run_blocking(move || asr.recognize(&audio, &params)).await?;
        let raw_text = recognition.text;
        info!("ASR done, raw text: {}", preview(&raw_text));

        let mut final_text = raw_text.clone();
        if options.use_punc && !raw_text.trim().is_empty() {
            if let Some(punc) = models.punc {
                let text = raw_text.clone();
                match run_blocking(move || punc.punctuate(&text)).await {
                    Ok(punctuated) => {
                        final_text = punctuated;
                        debug!("Punctuation restored");
                    }
                    Err(e) => warn!("Punctuation failed, keeping raw text: {:#}", e),
                }
            }
        }

        let probe = self.probe.clone();
        let audio = path.to_path_buf();
        let duration = match run_blocking(move || probe.duration_secs(&audio)).await {
            Ok(secs) => {
                state.total_audio_duration += secs;
                secs
            }
            Err(e) => {
                debug!("Could not determine duration of {}: {:#}", path.display(), e);
                0.0
            }
        };

        state.transcription_count += 1;
        if self.cleanup_interval > 0 && state.transcription_count % self.cleanup_interval == 0 {
            info!(
                "{} transcriptions completed, reclaiming memory",
                state.transcription_count
            );
            self.reclaimer.clone().cleanup_async().await;
        }

        info!("Transcription done: {}", preview(&final_text));

        Ok(TranscriptionResult {
            success: true,
            text: final_text,
            raw_text,
            confidence: recognition.confidence.unwrap_or(0.0),
            duration,
            language: RESULT_LANGUAGE.to_string(),
            model_type: RESULT_MODEL_TYPE.to_string(),
        })
    }
}

/// Run a blocking engine call off the async executor
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> ququ_engine::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .context("inference call panicked")?;
    Ok(result?)
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(100).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
