//! Line-delimited JSON command loop over stdin/stdout

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, error, info, warn};

use ququ_engine::{AudioDurationProbe, FileDurationProbe, InferenceEngine};

use crate::config::WorkerConfig;
use crate::lifecycle::ModelLifecycle;
use crate::pipeline::TranscriptionPipeline;
use crate::protocol::{
    round2, write_line, Action, Command, Outcome, PerformanceStats, Response, StatsReport,
    StatusReport,
};
use crate::reclaim::ResourceReclaimer;
use crate::shutdown::RunFlag;
use crate::state::ServerState;

/// What the loop does after answering a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// The worker: owns the state and answers commands one at a time
pub struct Worker {
    state: ServerState,
    engine: Arc<dyn InferenceEngine>,
    lifecycle: Arc<ModelLifecycle>,
    reclaimer: Arc<ResourceReclaimer>,
    pipeline: TranscriptionPipeline,
}

impl Worker {
    /// Build a worker whose readiness check and loads use `lifecycle`
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        lifecycle: ModelLifecycle,
        config: &WorkerConfig,
        running: RunFlag,
    ) -> Self {
        Self::with_probe(
            engine,
            lifecycle,
            Arc::new(FileDurationProbe),
            config,
            running,
        )
    }

    pub fn with_probe(
        engine: Arc<dyn InferenceEngine>,
        lifecycle: ModelLifecycle,
        probe: Arc<dyn AudioDurationProbe>,
        config: &WorkerConfig,
        running: RunFlag,
    ) -> Self {
        let lifecycle = Arc::new(lifecycle);
        let reclaimer = Arc::new(ResourceReclaimer::new(engine.clone()));
        let pipeline = TranscriptionPipeline::new(
            lifecycle.clone(),
            reclaimer.clone(),
            probe,
            config.transcription.clone(),
            config.cleanup_interval,
        );

        Self {
            state: ServerState::new(running),
            engine,
            lifecycle,
            reclaimer,
            pipeline,
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn reclaimer(&self) -> &ResourceReclaimer {
        &self.reclaimer
    }

    /// Readiness check plus initial model load; the result follows the
    /// startup sentinel
    pub async fn startup(&mut self) -> Outcome {
        if let Some(root) = self.lifecycle.model_root() {
            info!("📁 Model root: {}", root.display());
        }

        let missing = self.lifecycle.missing_models();
        if missing.is_empty() {
            info!("✓ All model files present, initializing");
        } else {
            warn!("⚠️ Models not downloaded: {}", missing.join(", "));
        }

        self.lifecycle.initialize(&mut self.state).await
    }

    /// Serve commands from `input` until EOF, `exit`, or a stop signal.
    ///
    /// Only I/O failures on the streams end the loop with an error.
    pub async fn run<R, W>(&mut self, mut input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();

        while self.state.running.is_running() {
            buf.clear();
            let n = input
                .read_until(b'\n', &mut buf)
                .await
                .context("Failed to read command")?;
            if n == 0 {
                info!("Input closed, stopping");
                break;
            }

            let (response, flow) = match self.handle_line(&buf).await {
                Ok(None) => continue,
                Ok(Some(reply)) => reply,
                Err(e) => {
                    error!("Command handling failed: {:?}", e);
                    (Outcome::unexpected(&e).into(), Flow::Continue)
                }
            };

            write_line(output, &response).await?;
            if flow == Flow::Exit {
                self.state.running.stop();
            }
        }

        info!("👋 Worker stopped");
        Ok(())
    }

    async fn handle_line(&mut self, raw: &[u8]) -> Result<Option<(Response, Flow)>> {
        let line = std::str::from_utf8(raw).context("command line is not valid UTF-8")?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Invalid command line: {}", e);
                return Ok(Some((
                    Outcome::error("invalid JSON command").into(),
                    Flow::Continue,
                )));
            }
        };

        self.handle_command(command).await.map(Some)
    }

    async fn handle_command(&mut self, command: Command) -> Result<(Response, Flow)> {
        let action = command.action();
        debug!("Received command: {:?}", action);

        let response = match action {
            Action::Transcribe => {
                self.pipeline
                    .transcribe(
                        &mut self.state,
                        command.audio_path.as_deref(),
                        command.options.as_ref(),
                    )
                    .await
            }
            Action::Status => self.status().await?,
            Action::Stats => self.stats(),
            Action::Cleanup => {
                self.reclaimer.clone().cleanup_async().await;
                Outcome::ok("memory cleanup completed").into()
            }
            Action::Exit => {
                info!("Received exit command");
                return Ok((Outcome::ok("server exiting").into(), Flow::Exit));
            }
            Action::Unknown(name) => Outcome::error(format!(
                "unknown command: {}",
                name.as_deref().unwrap_or("null")
            ))
            .into(),
        };

        Ok((response, Flow::Continue))
    }

    async fn status(&self) -> Result<Response> {
        let engine = self.engine.clone();
        let probe = tokio::task::spawn_blocking(move || engine.probe())
            .await
            .map_err(|e| anyhow!("engine probe panicked: {}", e))?;

        let report = match probe {
            Ok(info) => StatusReport {
                success: true,
                installed: true,
                initialized: self.state.initialized,
                version: Some(info.version),
                models: Some(self.state.models.flags()),
                error: None,
            },
            Err(e) => StatusReport {
                success: false,
                installed: false,
                initialized: false,
                version: None,
                models: None,
                error: Some(format!("FunASR is not installed: {}", e)),
            },
        };

        Ok(Response::Status(report))
    }

    fn stats(&self) -> Response {
        let count = self.state.transcription_count;
        let total = self.state.total_audio_duration;

        Response::Stats(StatsReport {
            success: true,
            stats: PerformanceStats {
                transcription_count: count,
                total_audio_duration: round2(total),
                average_duration: round2(total / count.max(1) as f64),
                initialized: self.state.initialized,
                models_loaded: self.state.models.flags(),
            },
        })
    }
}
