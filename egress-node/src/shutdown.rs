//! Graceful shutdown: named cleanup tasks run in reverse registration order
//! under one global time budget. The connection cleanup (unregistering from
//! the coordinator) is registered last so it runs first.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

/// Global budget for the whole cleanup stack
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Shared shutdown flag observed by long-lived workers
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

#[derive(Default)]
pub struct CleanupStack {
    tasks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup task. Later registrations run earlier.
    pub async fn register<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .await
            .push((name.to_string(), Box::new(move || Box::pin(task()))));
    }

    /// Run every task, newest first, within the global budget. Tasks that
    /// outlive the remaining budget are abandoned, not awaited.
    pub async fn run(&self) {
        let deadline = Instant::now() + SHUTDOWN_BUDGET;
        let mut tasks = self.tasks.lock().await;
        info!(count = tasks.len(), "Running shutdown cleanup");

        while let Some((name, task)) = tasks.pop() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(task = %name, "Shutdown budget exhausted, skipping remaining cleanup");
                tasks.clear();
                break;
            }

            match timeout(remaining, task()).await {
                Ok(()) => info!(task = %name, "Cleanup task finished"),
                Err(_) => warn!(task = %name, "Cleanup task exceeded the shutdown budget"),
            }
        }
    }
}
