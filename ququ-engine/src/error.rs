//! Error types for inference engine operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The inference library (or the program bridging to it) is not present
    #[error("Inference engine unavailable: {0}")]
    Unavailable(String),

    #[error("Model loading error: {0}")]
    Load(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio loading error: {0}")]
    AudioLoad(String),

    // The wrapped errors are rendered inline rather than exposed as a
    // source, so chained formatting prints their message once.
    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("JSON error: {0}")]
    Json(serde_json::Error),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl EngineError {
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn load<S: Into<String>>(msg: S) -> Self {
        Self::Load(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn audio_load<S: Into<String>>(msg: S) -> Self {
        Self::AudioLoad(msg.into())
    }
}
