//! ququ FunASR worker
//!
//! Spawned by the desktop app. Loads the ASR, VAD and punctuation models once,
//! then answers line-delimited JSON commands on stdin with one JSON line each
//! on stdout. Logs go to stderr and `<logs_dir>/funasr_server.log`.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ququ_engine::sidecar::SidecarEngine;
use ququ_engine::InferenceEngine;
use ququ_worker::config::WorkerConfig;
use ququ_worker::lifecycle::ModelLifecycle;
use ququ_worker::protocol::{write_line, write_startup, Outcome};
use ququ_worker::reclaim::get_memory_usage_mb;
use ququ_worker::shutdown::{spawn_signal_listener, RunFlag};
use ququ_worker::version::{version_short, VersionInfo};
use ququ_worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "ququ-worker", version, about = "FunASR speech recognition worker")]
struct Args {
    /// Directory holding the `damo` model repositories
    #[arg(long, env = "DAMO_ROOT", value_name = "DIR")]
    damo_root: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print build information and configured models, then exit
    #[arg(long)]
    version_verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.version_verbose {
        let models = WorkerConfig::load(args.config.as_deref())
            .map(|c| c.models)
            .unwrap_or_default();
        print!("{}", VersionInfo::current().describe(&models));
        return ExitCode::SUCCESS;
    }

    init_logging();

    match run(args).await {
        Ok(()) => {
            info!("server exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {:?}", e);
            let mut stdout = tokio::io::stdout();
            let _ = write_line(&mut stdout, &Outcome::unexpected(&e)).await;
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("🎙️ Starting {}", version_short());

    let mut config =
        WorkerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!("📋 Configuration loaded from {}", config.config_path.display());

    let model_root = ququ_paths::resolve_model_root(args.damo_root.as_deref());
    config.engine.model_root = Some(model_root.clone());

    let engine: Arc<dyn InferenceEngine> = Arc::new(SidecarEngine::new(config.engine.clone()));
    let lifecycle = ModelLifecycle::new(
        engine.clone(),
        config.models.descriptors(),
        config.load_timeout(),
    )
    .with_model_root(model_root)
    .context("Failed to compile model artifact patterns")?;

    let running = RunFlag::new();
    let _signals = spawn_signal_listener(running.clone());

    let mut worker = Worker::new(engine, lifecycle, &config, running);

    info!("🔧 Initializing models (this may take a moment)...");
    let init = worker.startup().await;
    if init.success {
        info!("✓ Worker ready");
    } else {
        warn!(
            "Startup initialization failed, transcribe will retry: {}",
            init.error.as_deref().unwrap_or_default()
        );
    }
    info!("📊 Memory usage: {} MB", get_memory_usage_mb());

    let mut stdout = tokio::io::stdout();
    write_startup(&mut stdout, &init)
        .await
        .context("Failed to write startup result")?;

    let stdin = BufReader::new(tokio::io::stdin());
    worker.run(stdin, &mut stdout).await
}

/// stderr plus an append-mode log file; stdout carries the protocol
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_path = ququ_paths::get_log_file_path();
    let file_layer = log_path
        .as_ref()
        .ok()
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        })
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        });
    let file_enabled = file_layer.is_some();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    match (log_path, file_enabled) {
        (Ok(path), true) => info!("📝 Logging to {}", path.display()),
        (Ok(path), false) => warn!("Could not open log file {}, logging to stderr only", path.display()),
        (Err(e), _) => warn!("No log directory ({:#}), logging to stderr only", e),
    }
}
