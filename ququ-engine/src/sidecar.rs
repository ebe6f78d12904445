//! Sidecar inference engine
//!
//! Bridges to the FunASR library through a helper program. Every loaded
//! model lives in its own child process so the three loads run in parallel
//! and a crash only takes one model down.
//!
//! Wire format (one JSON object per line on the child's stdin/stdout):
//!
//! ```text
//! child  → {"ready": true}                               // handshake, once
//! worker → {"id": 1, "op": "generate", "input": ..., ...}
//! child  → {"id": 1, "ok": true, "result": <library output>}
//! worker → {"id": 2, "op": "gc"}
//! child  → {"id": 2, "ok": true}
//! ```
//!
//! The child's stderr is inherited. Stdout lines that are not protocol
//! messages, and replies carrying an old id, are logged and skipped.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::engine::{
    normalize_segments, normalize_text_output, AsrModel, AsrParams, EngineInfo, InferenceEngine,
    ModelDescriptor, ModelKind, PunctuationModel, Recognition, SpeechSegment, VadModel,
};
use crate::error::{EngineError, Result};

/// Default helper program name looked up on `PATH`
pub const DEFAULT_PROGRAM: &str = "funasr-sidecar";

/// Sidecar configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Helper program (name on `PATH` or absolute path)
    pub program: String,

    /// Extra arguments placed before the per-model flags
    pub args: Vec<String>,

    /// Inference device passed to the library ("cpu", "cuda:0", ...)
    pub device: String,

    /// Thread count exported as `OMP_NUM_THREADS`
    pub threads: u32,

    /// Local `damo` root, forwarded so the library never downloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_root: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            device: "cpu".to_string(),
            threads: 4,
            model_root: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    closed: bool,
}

impl ChildIo {
    /// Kill and reap the child; later calls fail fast
    fn shut_down(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }

    /// Read until a line decodes as `T`. Library output that is not a
    /// protocol message is skipped.
    fn next_message<T: DeserializeOwned>(&mut self, kind: ModelKind) -> Result<T> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.stdout.read_line(&mut line).map_err(|e| {
                EngineError::protocol(format!("{} sidecar read failed: {}", kind, e))
            })?;
            if n == 0 {
                return Err(EngineError::protocol(format!(
                    "{} sidecar closed its stdout",
                    kind
                )));
            }

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str(text) {
                Ok(message) => return Ok(message),
                Err(_) => debug!("{} sidecar output: {}", kind, text),
            }
        }
    }

    /// Send `request` under a fresh id and wait for the reply carrying it
    fn exchange(&mut self, kind: ModelKind, request: &Value) -> Result<Reply> {
        self.next_id += 1;
        let id = self.next_id;

        let mut request = request.clone();
        if let Value::Object(map) = &mut request {
            map.insert("id".to_string(), Value::from(id));
        }
        let mut line = request.to_string();
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.flush())
            .map_err(|e| EngineError::protocol(format!("{} sidecar write failed: {}", kind, e)))?;

        loop {
            let reply: Reply = self.next_message(kind)?;
            if reply.id == id {
                return Ok(reply);
            }
            debug!(
                "{} sidecar: dropping reply {} while waiting for {}",
                kind, reply.id, id
            );
        }
    }
}

/// One running helper process serving a single model
struct SidecarProcess {
    kind: ModelKind,
    io: Mutex<ChildIo>,
}

impl SidecarProcess {
    fn spawn(program: &Path, config: &SidecarConfig, descriptor: &ModelDescriptor) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(&config.args)
            .arg("--serve")
            .args(["--model", &descriptor.identifier])
            .args(["--revision", &descriptor.revision])
            .args(["--device", &config.device])
            .env("OMP_NUM_THREADS", config.threads.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(root) = &config.model_root {
            command.arg("--model-root").arg(root);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::load(format!(
                "Failed to start {} for {}: {}",
                program.display(),
                descriptor.kind,
                e
            ))
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::load("Sidecar pipes unavailable"));
            }
        };

        let mut io = ChildIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
            closed: false,
        };

        let handshake = match io.next_message::<Handshake>(descriptor.kind) {
            Ok(handshake) => handshake,
            Err(e) => {
                io.shut_down();
                return Err(e);
            }
        };

        if !handshake.ready {
            io.shut_down();
            return Err(EngineError::load(
                handshake
                    .error
                    .unwrap_or_else(|| format!("{} model failed to load", descriptor.kind)),
            ));
        }

        Ok(Self {
            kind: descriptor.kind,
            io: Mutex::new(io),
        })
    }

    /// Send one request and wait for its reply.
    ///
    /// A broken pipe or a closed stdout stops the child for good; a reply
    /// with `ok: false` leaves it running.
    fn call(&self, request: &Value) -> Result<Value> {
        let mut io = self
            .io
            .lock()
            .map_err(|_| EngineError::protocol("Sidecar lock poisoned"))?;

        if io.closed {
            return Err(EngineError::protocol(format!(
                "{} sidecar is no longer running",
                self.kind
            )));
        }

        let reply = match io.exchange(self.kind, request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{} sidecar stopped responding: {}", self.kind, e);
                io.shut_down();
                return Err(e);
            }
        };

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(EngineError::inference(
                reply.error.unwrap_or_else(|| "unknown sidecar error".to_string()),
            ))
        }
    }
}

impl Drop for SidecarProcess {
    fn drop(&mut self) {
        self.io
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .shut_down();
        debug!("{} sidecar stopped", self.kind);
    }
}

struct SidecarAsr(Arc<SidecarProcess>);

impl AsrModel for SidecarAsr {
    fn recognize(&self, audio: &Path, params: &AsrParams) -> Result<Recognition> {
        let result = self.0.call(&json!({
            "op": "generate",
            "input": audio.to_string_lossy(),
            "batch_size_s": params.batch_size_s,
            "hotword": params.hotword,
        }))?;
        Ok(normalize_text_output(&result))
    }
}

struct SidecarVad(Arc<SidecarProcess>);

impl VadModel for SidecarVad {
    fn detect(&self, audio: &Path, batch_size_s: f64) -> Result<Vec<SpeechSegment>> {
        let result = self.0.call(&json!({
            "op": "generate",
            "input": audio.to_string_lossy(),
            "batch_size_s": batch_size_s,
        }))?;
        Ok(normalize_segments(&result))
    }
}

struct SidecarPunc(Arc<SidecarProcess>);

impl PunctuationModel for SidecarPunc {
    fn punctuate(&self, text: &str) -> Result<String> {
        let result = self.0.call(&json!({
            "op": "generate",
            "input": text,
        }))?;
        Ok(normalize_text_output(&result).text)
    }
}

/// [`InferenceEngine`] backed by helper processes
pub struct SidecarEngine {
    config: SidecarConfig,
    live: Mutex<Vec<Weak<SidecarProcess>>>,
}

impl SidecarEngine {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            live: Mutex::new(Vec::new()),
        }
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        which::which(&self.config.program).map_err(|e| {
            EngineError::unavailable(format!("{} not found: {}", self.config.program, e))
        })
    }

    fn start(&self, descriptor: &ModelDescriptor) -> Result<Arc<SidecarProcess>> {
        let program = self.resolve_program()?;
        info!(
            "Loading {} model {} ({})",
            descriptor.kind, descriptor.identifier, descriptor.revision
        );

        let process = Arc::new(SidecarProcess::spawn(&program, &self.config, descriptor)?);

        let mut live = self
            .live
            .lock()
            .map_err(|_| EngineError::protocol("Sidecar registry poisoned"))?;
        live.retain(|p| p.strong_count() > 0);
        live.push(Arc::downgrade(&process));

        Ok(process)
    }
}

impl InferenceEngine for SidecarEngine {
    fn probe(&self) -> Result<EngineInfo> {
        let program = self.resolve_program()?;
        let output = Command::new(&program)
            .args(&self.config.args)
            .arg("--version")
            .stderr(Stdio::null())
            .output()
            .map_err(|e| EngineError::unavailable(format!("{}: {}", program.display(), e)))?;

        if !output.status.success() {
            return Err(EngineError::unavailable(format!(
                "{} --version exited with {}",
                program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown")
            .to_string();

        Ok(EngineInfo { version })
    }

    fn load_asr(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn AsrModel>> {
        Ok(Arc::new(SidecarAsr(self.start(descriptor)?)))
    }

    fn load_vad(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn VadModel>> {
        Ok(Arc::new(SidecarVad(self.start(descriptor)?)))
    }

    fn load_punctuation(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn PunctuationModel>> {
        Ok(Arc::new(SidecarPunc(self.start(descriptor)?)))
    }

    fn reclaim(&self) -> Result<()> {
        let processes: Vec<Arc<SidecarProcess>> = {
            let live = self
                .live
                .lock()
                .map_err(|_| EngineError::protocol("Sidecar registry poisoned"))?;
            live.iter().filter_map(Weak::upgrade).collect()
        };

        for process in processes {
            if let Err(e) = process.call(&json!({ "op": "gc" })) {
                warn!("{} sidecar gc failed: {}", process.kind, e);
            }
        }
        Ok(())
    }
}
