//! Periodic background work with cooperative shutdown.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;

#[async_trait]
pub trait BackgroundTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One pass. Errors are logged and the task keeps running.
    async fn tick(&self) -> Result<()>;
}

/// A set of running tasks sharing one shutdown signal.
pub struct TaskGroup {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn start(tasks: Vec<Arc<dyn BackgroundTask>>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = tasks
            .into_iter()
            .map(|task| (task.name(), tokio::spawn(run(task, rx.clone()))))
            .collect();
        Self { shutdown, handles }
    }

    /// Signals every task and waits for each to finish its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("Background task '{}' ended abnormally: {}", name, e);
            }
        }
    }
}

async fn run(task: Arc<dyn BackgroundTask>, mut shutdown: watch::Receiver<bool>) {
    debug!("Background task '{}' started", task.name());
    loop {
        tokio::select! {
            _ = tokio::time::sleep(task.interval()) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        // Runs outside the select so a shutdown never cuts a pass short.
        if let Err(e) = task.tick().await {
            warn!("Background task '{}' pass failed: {}", task.name(), e);
        }
    }
    debug!("Background task '{}' stopped", task.name());
}
