//! Model lifecycle: concurrent, bounded-time loading of the three models

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use ququ_engine::{EngineError, InferenceEngine, ModelDescriptor, ModelKind};
use ququ_paths::{ArtifactMatcher, PathError};

use crate::protocol::{ErrorKind, Outcome};
use crate::state::{LoadedModel, ServerState};

/// Result of one load attempt
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub kind: ModelKind,
    pub success: bool,
    pub error: Option<String>,
}

impl LoadOutcome {
    fn failed(kind: ModelKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            success: false,
            error: Some(error.into()),
        }
    }
}

struct LoadReport {
    outcome: LoadOutcome,
    model: Option<LoadedModel>,
}

/// Message of the `models_not_downloaded` failure
pub const MODELS_NOT_DOWNLOADED: &str =
    "model files not downloaded, please download the models first";

/// On-disk artifact check run before any load is attempted
struct Readiness {
    model_root: PathBuf,
    matcher: ArtifactMatcher,
}

/// Loads the ASR, VAD and punctuation models and tracks readiness
pub struct ModelLifecycle {
    engine: Arc<dyn InferenceEngine>,
    descriptors: Vec<ModelDescriptor>,
    load_timeout: Duration,
    readiness: Option<Readiness>,
}

impl ModelLifecycle {
    /// `descriptors` are loaded, and their timeouts checked, in the given order
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        descriptors: Vec<ModelDescriptor>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            descriptors,
            load_timeout,
            readiness: None,
        }
    }

    /// Require every model repository under `model_root` to hold artifacts
    /// before loading
    pub fn with_model_root(mut self, model_root: PathBuf) -> Result<Self, PathError> {
        self.readiness = Some(Readiness {
            model_root,
            matcher: ArtifactMatcher::new()?,
        });
        Ok(self)
    }

    pub fn model_root(&self) -> Option<&Path> {
        self.readiness.as_ref().map(|r| r.model_root.as_path())
    }

    /// Repository names with no artifacts on disk (empty without a model root)
    pub fn missing_models(&self) -> Vec<String> {
        match &self.readiness {
            Some(r) => r.matcher.missing_repos(
                &r.model_root,
                self.descriptors.iter().map(ModelDescriptor::repo_dir_name),
            ),
            None => Vec::new(),
        }
    }

    /// Load every model in parallel.
    ///
    /// A no-op when already initialized. Nothing is loaded while a model
    /// repository is missing from disk. Each task is awaited in order with
    /// its own ceiling; the first one still running when its wait expires
    /// fails the whole call with `timeout_error` without waiting for the rest.
    /// Handles of loads that succeeded are kept even when the call fails, but
    /// `initialized` only becomes true when all of them succeeded.
    pub async fn initialize(&self, state: &mut ServerState) -> Outcome {
        if state.initialized {
            return Outcome::ok("models already initialized");
        }

        let missing = self.missing_models();
        if !missing.is_empty() {
            warn!("Model files missing: {}", missing.join(", "));
            return Outcome::failure(ErrorKind::ModelsNotDownloaded, MODELS_NOT_DOWNLOADED);
        }

        let engine = self.engine.clone();
        let probed = tokio::task::spawn_blocking(move || engine.probe())
            .await
            .unwrap_or_else(|e| Err(EngineError::unavailable(format!("probe panicked: {}", e))));

        let info = match probed {
            Ok(info) => info,
            Err(e) => {
                error!("FunASR is not available: {}", e);
                return Outcome::failure(
                    ErrorKind::ImportError,
                    format!("FunASR is not installed: {}", e),
                );
            }
        };

        info!("Initializing FunASR {} models in parallel...", info.version);
        let start = Instant::now();

        let mut pending = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            match spawn_load(self.engine.clone(), descriptor.clone()) {
                Ok(rx) => pending.push((descriptor.kind, rx)),
                Err(e) => {
                    error!("Could not start {} load thread: {}", descriptor.kind, e);
                    return Outcome::failure(
                        ErrorKind::InitError,
                        format!("model initialization failed: {}", e),
                    );
                }
            }
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (kind, rx) in pending {
            match tokio::time::timeout(self.load_timeout, rx).await {
                Ok(Ok(report)) => {
                    if let Some(model) = report.model {
                        state.models.insert(model);
                    }
                    outcomes.push(report.outcome);
                }
                Ok(Err(_)) => {
                    error!("{} load thread exited without reporting", kind);
                    outcomes.push(LoadOutcome::failed(kind, "load thread panicked"));
                }
                Err(_) => {
                    error!(
                        "{} model load timed out after {}s",
                        kind,
                        self.load_timeout.as_secs()
                    );
                    return Outcome::failure(ErrorKind::TimeoutError, "model loading timed out");
                }
            }
        }

        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.kind.as_str())
            .collect();

        if !failed.is_empty() {
            state.initialized = false;
            let message = format!("models failed: {}", failed.join(", "));
            error!("{}", message);
            return Outcome::failure(ErrorKind::InitError, message);
        }

        debug_assert!(state.models.all_loaded());
        state.initialized = true;

        let elapsed = start.elapsed().as_secs_f64();
        info!("✓ All models initialized in {:.2}s", elapsed);
        Outcome::ok(format!(
            "models initialized in parallel, elapsed {:.2}s",
            elapsed
        ))
    }
}

/// Run one load on its own OS thread and report over a oneshot channel.
///
/// A thread that outlives its timeout is left to finish on its own; its
/// report is dropped.
fn spawn_load(
    engine: Arc<dyn InferenceEngine>,
    descriptor: ModelDescriptor,
) -> std::io::Result<oneshot::Receiver<LoadReport>> {
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name(format!("load-{}", descriptor.kind))
        .spawn(move || {
            let start = Instant::now();
            let kind = descriptor.kind;

            let result = match kind {
                ModelKind::Asr => engine.load_asr(&descriptor).map(LoadedModel::Asr),
                ModelKind::Vad => engine.load_vad(&descriptor).map(LoadedModel::Vad),
                ModelKind::Punc => engine.load_punctuation(&descriptor).map(LoadedModel::Punc),
            };

            let report = match result {
                Ok(model) => {
                    info!("{} model loaded", kind);
                    LoadReport {
                        outcome: LoadOutcome {
                            kind,
                            success: true,
                            error: None,
                        },
                        model: Some(model),
                    }
                }
                Err(e) => {
                    error!("{} model failed to load: {}", kind, e);
                    LoadReport {
                        outcome: LoadOutcome::failed(kind, e.to_string()),
                        model: None,
                    }
                }
            };

            info!(
                "{} load thread took {:.2}s",
                kind,
                start.elapsed().as_secs_f64()
            );
            let _ = tx.send(report);
        })?;

    Ok(rx)
}
