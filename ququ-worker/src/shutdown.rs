//! Cooperative shutdown
//!
//! Signals only clear the run flag. The dispatcher checks the flag between
//! commands, so an in-flight transcription always finishes and a read that
//! is blocked on stdin keeps the process alive until the peer writes or
//! closes the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared RUNNING/STOPPING flag
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// RUNNING → STOPPING. Idempotent.
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Clear `flag` on SIGTERM or SIGINT
pub fn spawn_signal_listener(flag: RunFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        flag.stop();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("🛑 Received SIGINT, stopping after the current command");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("🛑 Received SIGTERM, stopping after the current command"),
        _ = tokio::signal::ctrl_c() => info!("🛑 Received SIGINT, stopping after the current command"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("🛑 Received Ctrl-C, stopping after the current command");
    }
}
