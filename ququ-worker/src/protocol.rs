//! Line-delimited JSON protocol spoken on stdin/stdout
//!
//! Every command is one JSON object per line; every response is exactly one
//! JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::state::ModelFlags;

/// Line printed right before the startup result.
///
/// Host-side parsers match it byte-for-byte; never change it.
pub const INIT_SENTINEL: &str = "__FUNASR_INIT_RESULT__";

/// Decoded request line
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub audio_path: Option<String>,

    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

impl Command {
    /// Parse a trimmed, non-empty line
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn action(&self) -> Action {
        Action::from_name(self.action.as_deref())
    }
}

/// Dispatch target of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transcribe,
    Status,
    Stats,
    Cleanup,
    Exit,
    /// Anything else; `None` when the field was absent
    Unknown(Option<String>),
}

impl Action {
    fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("transcribe") => Self::Transcribe,
            Some("status") => Self::Status,
            Some("stats") => Self::Stats,
            Some("cleanup") => Self::Cleanup,
            Some("exit") => Self::Exit,
            other => Self::Unknown(other.map(str::to_string)),
        }
    }
}

/// Failure taxonomy reported in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inference library unavailable
    ImportError,
    /// One or more model loads failed
    InitError,
    /// A model load exceeded its ceiling
    TimeoutError,
    /// Anything failing inside a transcription request
    TranscriptionError,
    /// Model artifacts are not on disk
    ModelsNotDownloaded,
}

/// Generic success/failure response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            kind: None,
            traceback: None,
        }
    }

    /// Failure without a taxonomy tag
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            kind: None,
            traceback: None,
        }
    }

    pub fn failure(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            ..Self::error(error)
        }
    }

    /// Failure for an error that escaped command handling
    pub fn unexpected(err: &anyhow::Error) -> Self {
        Self {
            traceback: Some(format!("{:?}", err)),
            ..Self::error(err.to_string())
        }
    }
}

/// Successful transcription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    pub success: bool,
    pub text: String,
    pub raw_text: String,
    pub confidence: f32,
    /// Audio length in seconds (0.0 when it could not be determined)
    pub duration: f64,
    pub language: String,
    pub model_type: String,
}

/// Reply to `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub success: bool,
    pub installed: bool,
    pub initialized: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelFlags>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters reported by `stats`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub transcription_count: u64,
    pub total_audio_duration: f64,
    pub average_duration: f64,
    pub initialized: bool,
    pub models_loaded: ModelFlags,
}

/// Reply to `stats`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub success: bool,
    pub stats: PerformanceStats,
}

/// Any response line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Outcome(Outcome),
    Transcription(TranscriptionResult),
    Status(StatusReport),
    Stats(StatsReport),
}

impl Response {
    pub fn is_success(&self) -> bool {
        match self {
            Response::Outcome(o) => o.success,
            Response::Transcription(t) => t.success,
            Response::Status(s) => s.success,
            Response::Stats(s) => s.success,
        }
    }
}

impl From<Outcome> for Response {
    fn from(outcome: Outcome) -> Self {
        Response::Outcome(outcome)
    }
}

/// Round to two decimals, as reported in stats
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Serialize `value` as one line and flush immediately
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the sentinel line followed by the startup result
pub async fn write_startup<W>(writer: &mut W, init: &Outcome) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(INIT_SENTINEL.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    write_line(writer, init).await
}
