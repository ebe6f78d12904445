//! Inference engine adapter for the ququ FunASR worker
//!
//! The worker never runs model code itself. It talks to an
//! [`InferenceEngine`], which exposes three independently loadable
//! capabilities (ASR, VAD, punctuation restoration) and hands back
//! shareable model handles.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ququ_engine::{InferenceEngine, ModelDescriptor, ModelKind, ModelSource};
//! use ququ_engine::sidecar::{SidecarConfig, SidecarEngine};
//!
//! let engine = SidecarEngine::new(SidecarConfig::default());
//! println!("FunASR {}", engine.probe()?.version);
//!
//! let asr = engine.load_asr(&ModelDescriptor::new(
//!     ModelKind::Asr,
//!     &ModelSource::funasr_default(ModelKind::Asr),
//! ))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod audio;
pub mod engine;
pub mod error;
pub mod sidecar;

pub use audio::{AudioDurationProbe, FileDurationProbe};
pub use engine::{
    normalize_segments, normalize_text_output, AsrModel, AsrParams, EngineInfo, InferenceEngine,
    ModelDescriptor, ModelKind, ModelSource, PunctuationModel, Recognition, SpeechSegment,
    VadModel,
};
pub use error::{EngineError, Result};
