use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Shared flag asking the bridge to reload at its next safe point.
///
/// Cloned handles refer to the same request, so a signal task or a script
/// can ask for a reload that the bridge owner later picks up.
#[derive(Debug, Clone, Default)]
pub struct ReloadHandle(Arc<AtomicBool>);

impl ReloadHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Spawn a task that requests a reload whenever SIGUSR2 arrives
#[cfg(unix)]
pub fn spawn_reload_signal(handle: ReloadHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "scripting", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        while sigusr2.recv().await.is_some() {
            info!(target: "scripting", "Received SIGUSR2 - requesting script reload");
            handle.request();
        }
    })
}

/// SIGUSR2 does not exist here; reloads must be requested some other way
#[cfg(not(unix))]
pub fn spawn_reload_signal(_handle: ReloadHandle) -> tokio::task::JoinHandle<()> {
    tracing::warn!(target: "scripting", "SIGUSR2 reload not supported on this platform");
    tokio::spawn(async {})
}
