//! Periodic memory reclamation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

use ququ_engine::InferenceEngine;

/// Asks the inference runtime to release memory. Never fails.
pub struct ResourceReclaimer {
    engine: Arc<dyn InferenceEngine>,
    passes: AtomicU64,
}

impl ResourceReclaimer {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            passes: AtomicU64::new(0),
        }
    }

    /// Run one reclamation pass, logging (not returning) any failure
    pub fn cleanup(&self) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        let before = get_memory_usage_mb();

        match self.engine.reclaim() {
            Ok(()) => info!(
                "🧹 Memory cleanup completed ({} MB → {} MB)",
                before,
                get_memory_usage_mb()
            ),
            Err(e) => warn!("Memory cleanup failed: {}", e),
        }
    }

    /// [`cleanup`](Self::cleanup) on the blocking pool
    pub async fn cleanup_async(self: Arc<Self>) {
        if let Err(e) = tokio::task::spawn_blocking(move || self.cleanup()).await {
            warn!("Memory cleanup task panicked: {}", e);
        }
    }

    /// Number of passes run so far
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }
}

/// Get current process memory usage in MB
pub fn get_memory_usage_mb() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);

    sys.process(pid)
        .map(|process| process.memory() / 1_048_576)
        .unwrap_or(0)
}
