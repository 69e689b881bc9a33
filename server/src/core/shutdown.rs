//! Centralized shutdown management
//!
//! Components register their task handles here; `shutdown()` signals every
//! subscriber, then waits for the registered tasks inside a bounded budget.
//! Registration order is startup order, and tasks are awaited in reverse so
//! components drain in the opposite order they came up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::constants::{EXIT_ABORTED, SHUTDOWN_TIMEOUT_SECS};

/// Centralized shutdown service for coordinating graceful shutdown
#[derive(Clone)]
pub struct ShutdownService {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for ShutdownService {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownService {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a background task handle to be awaited during shutdown.
    /// Call in startup order; draining happens in reverse.
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Subscribe to the shutdown signal
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown and wait for all registered tasks to complete.
    ///
    /// Tasks are awaited newest-first (reverse startup order) under one
    /// total budget. Tasks still running when the budget elapses are
    /// force-aborted.
    pub async fn shutdown(&self) {
        tracing::debug!("Initiating graceful shutdown...");
        self.trigger();

        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        handles.reverse();
        let task_count = handles.len();
        tracing::debug!(count = task_count, "Waiting for components to drain...");

        let budget = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        let deadline = tokio::time::Instant::now() + budget;

        let mut forced = 0usize;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
                forced += 1;
            }
        }

        if forced > 0 {
            tracing::warn!(
                forced,
                budget_secs = budget.as_secs(),
                "Shutdown budget elapsed, remaining components force-stopped"
            );
        } else {
            tracing::debug!("All components drained");
        }

        tracing::debug!("Shutdown complete");
    }

    /// Wait for shutdown signal (for use with axum graceful shutdown).
    /// Returns an owned future that can be passed to graceful_shutdown.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Install OS signal handlers. The first Ctrl+C/SIGTERM triggers a
    /// graceful shutdown; a second signal aborts the process immediately
    /// with the dedicated exit code.
    pub fn install_signal_handlers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received, draining...");
            service.trigger();

            wait_for_signal().await;
            tracing::warn!("Second signal received, aborting shutdown");
            std::process::exit(EXIT_ABORTED);
        });
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
