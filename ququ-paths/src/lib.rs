//! Path utilities for the ququ FunASR worker.
//!
//! Single source of truth for where the worker looks for models, where it
//! writes its log file and where its configuration lives.
//!
//! # Model root resolution
//!
//! | Priority | Source | Layout |
//! |----------|--------|--------|
//! | 1 | `--damo-root` / `DAMO_ROOT` | used as-is |
//! | 2 | `$MODELSCOPE_CACHE` | `<cache>/damo`, `<cache>/hub/models/damo`, `<cache>/hub/damo` |
//! | 3 | home directory | `~/.cache/modelscope/hub/models/damo` if present |
//! | 4 | home directory | `~/.cache/modelscope/hub/damo` |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::debug;

/// Errors specific to path operations.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not determine config directory")]
    NoConfigDirectory,

    #[error("Invalid artifact pattern: {0}")]
    InvalidPattern(#[from] globset::Error),
}

/// Application identifier used in path construction.
const APP_NAME: &str = "ququ";

/// Environment variable naming a ModelScope cache root.
pub const MODELSCOPE_CACHE_ENV: &str = "MODELSCOPE_CACHE";

/// Environment variable set by the host application for its user data.
pub const USER_DATA_ENV: &str = "ELECTRON_USER_DATA";

/// Log file name inside the logs directory.
pub const LOG_FILE_NAME: &str = "funasr_server.log";

/// Files whose presence marks a model directory as downloaded.
pub const ARTIFACT_PATTERNS: &[&str] = &[
    "model.pt",
    "pytorch_model.bin",
    "*.onnx",
    "config.json",
    "configuration.json",
    "model.yaml",
    "vocab*",
];

/// Resolve the `damo` model root from the process environment.
///
/// `explicit` wins when given; otherwise `$MODELSCOPE_CACHE` and the home
/// directory are consulted.
pub fn resolve_model_root(explicit: Option<&Path>) -> PathBuf {
    resolve_model_root_from(
        explicit,
        std::env::var_os(MODELSCOPE_CACHE_ENV).map(PathBuf::from),
        dirs::home_dir(),
    )
}

/// Environment-free variant of [`resolve_model_root`].
pub fn resolve_model_root_from(
    explicit: Option<&Path>,
    modelscope_cache: Option<PathBuf>,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(root) = explicit {
        return root.to_path_buf();
    }

    if let Some(cache) = modelscope_cache {
        let layouts = [
            cache.join("damo"),
            cache.join("hub").join("models").join("damo"),
            cache.join("hub").join("damo"),
        ];
        if let Some(found) = layouts.into_iter().find(|p| p.is_dir()) {
            return found;
        }
        // None of the known layouts exist; fall through to the home directory
    }

    let hub = home
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("modelscope")
        .join("hub");

    let models_damo = hub.join("models").join("damo");
    if models_damo.is_dir() {
        return models_damo;
    }
    hub.join("damo")
}

/// Matcher over [`ARTIFACT_PATTERNS`].
pub struct ArtifactMatcher {
    set: GlobSet,
}

impl ArtifactMatcher {
    /// Compile the default artifact patterns.
    pub fn new() -> std::result::Result<Self, PathError> {
        Self::with_patterns(ARTIFACT_PATTERNS)
    }

    /// Compile a custom pattern list.
    pub fn with_patterns(patterns: &[&str]) -> std::result::Result<Self, PathError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    /// True if `dir` exists and holds at least one entry matching a pattern.
    ///
    /// Only the top level of the directory is inspected.
    pub fn repo_ready(&self, dir: &Path) -> bool {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return false,
        };

        entries
            .filter_map(|entry| entry.ok())
            .any(|entry| self.set.is_match(entry.file_name()))
    }

    /// Names from `repos` whose directory under `root` is not ready.
    pub fn missing_repos<'a, I>(&self, root: &Path, repos: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        repos
            .into_iter()
            .filter(|repo| {
                let ready = self.repo_ready(&root.join(repo));
                debug!("Model repo {} ready: {}", repo, ready);
                !ready
            })
            .map(str::to_string)
            .collect()
    }
}

/// Get the logs directory.
///
/// `$ELECTRON_USER_DATA/logs` when the host provides it, otherwise
/// `<tmp>/ququ_logs`. Created if it doesn't exist.
pub fn get_logs_dir() -> Result<PathBuf> {
    let logs_dir = logs_dir_from(std::env::var_os(USER_DATA_ENV).map(PathBuf::from));

    if !logs_dir.exists() {
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;
    }

    Ok(logs_dir)
}

fn logs_dir_from(user_data: Option<PathBuf>) -> PathBuf {
    match user_data {
        Some(dir) => dir.join("logs"),
        None => std::env::temp_dir().join(format!("{}_logs", APP_NAME)),
    }
}

/// Full path of the worker log file.
pub fn get_log_file_path() -> Result<PathBuf> {
    Ok(get_logs_dir()?.join(LOG_FILE_NAME))
}

/// Get the configuration directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/ququ`
/// - **macOS**: `~/Library/Application Support/ququ`
/// - **Windows**: `%APPDATA%/ququ`
pub fn get_config_dir() -> Result<PathBuf> {
    let config_base = dirs::config_dir().ok_or(PathError::NoConfigDirectory)?;
    Ok(config_base.join(APP_NAME))
}
