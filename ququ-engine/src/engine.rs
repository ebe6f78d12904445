//! Inference engine interface: the three loadable capabilities and their handles

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Default revision for every FunASR model repository
pub const DEFAULT_REVISION: &str = "v2.0.4";

/// The three model slots the worker keeps resident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Asr,
    Vad,
    Punc,
}

impl ModelKind {
    /// All kinds, in load (and timeout check) order
    pub const ALL: [ModelKind; 3] = [ModelKind::Asr, ModelKind::Vad, ModelKind::Punc];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Asr => "asr",
            ModelKind::Vad => "vad",
            ModelKind::Punc => "punc",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a model comes from (configurable part of a descriptor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    /// ModelScope identifier, e.g. `damo/speech_fsmn_vad_zh-cn-16k-common-pytorch`
    pub identifier: String,
    pub revision: String,
}

impl ModelSource {
    /// Stock FunASR repository for `kind`
    pub fn funasr_default(kind: ModelKind) -> Self {
        let identifier = match kind {
            ModelKind::Asr => {
                "damo/speech_paraformer-large_asr_nat-zh-cn-16k-common-vocab8404-pytorch"
            }
            ModelKind::Vad => "damo/speech_fsmn_vad_zh-cn-16k-common-pytorch",
            ModelKind::Punc => "damo/punc_ct-transformer_zh-cn-common-vocab272727-pytorch",
        };
        Self {
            identifier: identifier.to_string(),
            revision: DEFAULT_REVISION.to_string(),
        }
    }
}

/// Immutable description of one model the lifecycle manager loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub kind: ModelKind,
    pub identifier: String,
    pub revision: String,
}

impl ModelDescriptor {
    pub fn new(kind: ModelKind, source: &ModelSource) -> Self {
        Self {
            kind,
            identifier: source.identifier.clone(),
            revision: source.revision.clone(),
        }
    }

    /// Directory name under the `damo` root (identifier without its namespace)
    pub fn repo_dir_name(&self) -> &str {
        self.identifier
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.identifier)
    }
}

/// Information returned by a successful [`InferenceEngine::probe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub version: String,
}

/// Parameters forwarded to the ASR capability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsrParams {
    /// Seconds of audio per inference batch
    pub batch_size_s: f64,
    pub hotword: String,
}

/// A detected speech region in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Normalized text output of ASR or punctuation
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Per-utterance confidence, when the library reports one
    pub confidence: Option<f32>,
}

/// Loaded speech recognition model
pub trait AsrModel: Send + Sync {
    fn recognize(&self, audio: &Path, params: &AsrParams) -> Result<Recognition>;
}

/// Loaded voice activity detection model
pub trait VadModel: Send + Sync {
    fn detect(&self, audio: &Path, batch_size_s: f64) -> Result<Vec<SpeechSegment>>;
}

/// Loaded punctuation restoration model
pub trait PunctuationModel: Send + Sync {
    fn punctuate(&self, text: &str) -> Result<String>;
}

/// Pluggable inference backend.
///
/// Every method may block for a long time. Implementations must be safe to
/// call from several threads at once: the three `load_*` calls run
/// concurrently during initialization.
pub trait InferenceEngine: Send + Sync {
    /// Check that the backing library is present.
    ///
    /// An error here means no model can ever be loaded.
    fn probe(&self) -> Result<EngineInfo>;

    fn load_asr(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn AsrModel>>;

    fn load_vad(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn VadModel>>;

    fn load_punctuation(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn PunctuationModel>>;

    /// Ask the runtime to release cached memory. Best-effort.
    fn reclaim(&self) -> Result<()> {
        Ok(())
    }
}

/// Normalize the loosely shaped text output of the inference library.
///
/// Accepted shapes, in order:
/// - `[{"text": ..., "confidence"?: ...}, ...]` → first element's text
/// - `[other, ...]` → string form of the first element
/// - `"text"` → the string itself
/// - anything else (empty list included) → string form of the whole value
pub fn normalize_text_output(value: &Value) -> Recognition {
    match value {
        Value::Array(items) if !items.is_empty() => match &items[0] {
            Value::Object(map) if map.contains_key("text") => Recognition {
                text: value_to_text(&map["text"]),
                confidence: map
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .map(|c| c as f32),
            },
            first => Recognition {
                text: value_to_text(first),
                confidence: None,
            },
        },
        other => Recognition {
            text: value_to_text(other),
            confidence: None,
        },
    }
}

/// Normalize VAD output into segments.
///
/// Accepts `[{"value": [[start, end], ...]}, ...]` or a bare `[[start, end], ...]`.
/// Malformed pairs are skipped.
pub fn normalize_segments(value: &Value) -> Vec<SpeechSegment> {
    let pairs = match value {
        Value::Array(items) => match items.first() {
            Some(Value::Object(map)) => map.get("value").and_then(Value::as_array),
            Some(_) => Some(items),
            None => None,
        },
        Value::Object(map) => map.get("value").and_then(Value::as_array),
        _ => None,
    };

    pairs
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| {
                    let pair = pair.as_array()?;
                    Some(SpeechSegment {
                        start_ms: pair.first()?.as_i64()?,
                        end_ms: pair.get(1)?.as_i64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names() {
        assert_eq!(ModelKind::Asr.to_string(), "asr");
        assert_eq!(ModelKind::Vad.to_string(), "vad");
        assert_eq!(ModelKind::Punc.to_string(), "punc");
        assert_eq!(serde_json::to_string(&ModelKind::Punc).unwrap(), "\"punc\"");
    }

    #[test]
    fn test_repo_dir_name() {
        let d = ModelDescriptor::new(ModelKind::Vad, &ModelSource::funasr_default(ModelKind::Vad));
        assert_eq!(d.repo_dir_name(), "speech_fsmn_vad_zh-cn-16k-common-pytorch");
        assert_eq!(d.revision, "v2.0.4");

        let bare = ModelDescriptor {
            kind: ModelKind::Asr,
            identifier: "local-model".to_string(),
            revision: "main".to_string(),
        };
        assert_eq!(bare.repo_dir_name(), "local-model");
    }

    #[test]
    fn test_normalize_list_of_dicts() {
        let out = normalize_text_output(&json!([{"key": "a", "text": "你好世界", "confidence": 0.5}]));
        assert_eq!(out.text, "你好世界");
        assert_eq!(out.confidence, Some(0.5));

        let out = normalize_text_output(&json!([{"key": "a", "text": "hi"}]));
        assert_eq!(out.confidence, None);
    }

    #[test]
    fn test_normalize_fallbacks() {
        assert_eq!(normalize_text_output(&json!(["plain"])).text, "plain");
        assert_eq!(normalize_text_output(&json!([{"key": "x"}])).text, "{\"key\":\"x\"}");
        assert_eq!(normalize_text_output(&json!("bare")).text, "bare");
        assert_eq!(normalize_text_output(&json!([])).text, "[]");
        assert_eq!(normalize_text_output(&json!(null)).text, "null");
    }

    #[test]
    fn test_normalize_segments() {
        let segs = normalize_segments(&json!([{"key": "a", "value": [[0, 1200], [1500, 3000]]}]));
        assert_eq!(
            segs,
            vec![
                SpeechSegment { start_ms: 0, end_ms: 1200 },
                SpeechSegment { start_ms: 1500, end_ms: 3000 },
            ]
        );

        let bare = normalize_segments(&json!([[10, 20], ["bad"], [30, 40]]));
        assert_eq!(bare.len(), 2);

        assert!(normalize_segments(&json!("nothing")).is_empty());
    }
}
