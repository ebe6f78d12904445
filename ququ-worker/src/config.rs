//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use ququ_engine::sidecar::SidecarConfig;
use ququ_engine::{ModelDescriptor, ModelKind, ModelSource};

use crate::pipeline::TranscriptionOptions;

/// Model repositories to load, one per slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub asr: ModelSource,
    pub vad: ModelSource,
    pub punc: ModelSource,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            asr: ModelSource::funasr_default(ModelKind::Asr),
            vad: ModelSource::funasr_default(ModelKind::Vad),
            punc: ModelSource::funasr_default(ModelKind::Punc),
        }
    }
}

impl ModelsConfig {
    pub fn source(&self, kind: ModelKind) -> &ModelSource {
        match kind {
            ModelKind::Asr => &self.asr,
            ModelKind::Vad => &self.vad,
            ModelKind::Punc => &self.punc,
        }
    }

    /// Descriptors in load order (ASR, VAD, punctuation)
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        ModelKind::ALL
            .iter()
            .map(|&kind| ModelDescriptor::new(kind, self.source(kind)))
            .collect()
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Ceiling for each model load task (seconds)
    pub load_timeout_secs: u64,

    /// Reclaim memory after every N completed transcriptions (0 disables)
    pub cleanup_interval: u64,

    /// Model repositories
    pub models: ModelsConfig,

    /// Defaults merged under per-request transcription options
    pub transcription: TranscriptionOptions,

    /// Inference sidecar settings
    pub engine: SidecarConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            load_timeout_secs: 300,
            cleanup_interval: 10,
            models: ModelsConfig::default(),
            transcription: TranscriptionOptions::default(),
            engine: SidecarConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from `path` (or the default location), or create default
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;

            let mut config: WorkerConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;

            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            // A read-only config dir must not keep the worker from starting
            if let Err(e) = config.save() {
                warn!("Could not write default config: {:#}", e);
            }
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    fn default_config_path() -> PathBuf {
        ququ_paths::get_config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("config.toml")
    }
}
