//! Process-wide worker state, owned by the dispatcher

use std::sync::Arc;

use serde::Serialize;

use ququ_engine::{AsrModel, ModelKind, PunctuationModel, VadModel};

use crate::shutdown::RunFlag;

/// A handle produced by one load task
#[derive(Clone)]
pub enum LoadedModel {
    Asr(Arc<dyn AsrModel>),
    Vad(Arc<dyn VadModel>),
    Punc(Arc<dyn PunctuationModel>),
}

/// Resident model handles, one optional slot per kind
#[derive(Clone, Default)]
pub struct LoadedModels {
    pub asr: Option<Arc<dyn AsrModel>>,
    pub vad: Option<Arc<dyn VadModel>>,
    pub punc: Option<Arc<dyn PunctuationModel>>,
}

impl LoadedModels {
    /// Store a handle in its slot, replacing any previous one
    pub fn insert(&mut self, model: LoadedModel) {
        match model {
            LoadedModel::Asr(m) => self.asr = Some(m),
            LoadedModel::Vad(m) => self.vad = Some(m),
            LoadedModel::Punc(m) => self.punc = Some(m),
        }
    }

    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        match kind {
            ModelKind::Asr => self.asr.is_some(),
            ModelKind::Vad => self.vad.is_some(),
            ModelKind::Punc => self.punc.is_some(),
        }
    }

    pub fn all_loaded(&self) -> bool {
        ModelKind::ALL.iter().all(|&kind| self.is_loaded(kind))
    }

    pub fn flags(&self) -> ModelFlags {
        ModelFlags {
            asr: self.asr.is_some(),
            vad: self.vad.is_some(),
            punc: self.punc.is_some(),
        }
    }
}

/// Per-model readiness as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModelFlags {
    pub asr: bool,
    pub vad: bool,
    pub punc: bool,
}

/// Worker state.
///
/// Invariant: `initialized` implies every slot in `models` is filled. Only
/// the lifecycle manager flips `initialized`.
pub struct ServerState {
    pub initialized: bool,
    pub running: RunFlag,
    pub transcription_count: u64,
    /// Seconds of audio transcribed, counting only files whose length was known
    pub total_audio_duration: f64,
    pub models: LoadedModels,
}

impl ServerState {
    pub fn new(running: RunFlag) -> Self {
        Self {
            initialized: false,
            running,
            transcription_count: 0,
            total_audio_duration: 0.0,
            models: LoadedModels::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ququ_engine::{PunctuationModel, Result};

    struct Echo;

    impl PunctuationModel for Echo {
        fn punctuate(&self, text: &str) -> Result<String> {
            Ok(format!("{}。", text))
        }
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = ServerState::new(RunFlag::new());
        assert!(!state.initialized);
        assert!(state.running.is_running());
        assert_eq!(state.transcription_count, 0);
        assert_eq!(state.models.flags(), ModelFlags::default());
        assert!(!state.models.all_loaded());
    }

    #[test]
    fn test_insert_fills_one_slot() {
        let mut models = LoadedModels::default();
        models.insert(LoadedModel::Punc(Arc::new(Echo)));
        assert_eq!(
            models.flags(),
            ModelFlags {
                asr: false,
                vad: false,
                punc: true
            }
        );
        assert!(models.is_loaded(ModelKind::Punc));
        assert!(!models.all_loaded());
    }
}
