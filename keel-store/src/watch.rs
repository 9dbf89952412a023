//! Watch subscription lifecycle.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running prefix watch.
///
/// Dropping the subscription aborts the watch task immediately. Call
/// [`cancel`](WatchSubscription::cancel) instead to let the task observe
/// the stop signal and shut down cleanly.
#[derive(Debug)]
pub struct WatchSubscription {
    prefix: String,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    /// Wrap a spawned watch task. Used by backend implementations.
    pub fn new(prefix: impl Into<String>, stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        WatchSubscription {
            prefix: prefix.into(),
            stop,
            task: Some(task),
        }
    }

    /// The absolute prefix this subscription observes.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the watch task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the watch task to stop and wait for it to finish. Events
    /// already queued for the handler are still delivered.
    pub async fn cancel(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
