//! Periodic background cleanup tasks.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Handle to a running sweep task. Dropping it stops the task.
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Run `sweep` every `interval` until stopped.
    ///
    /// `sweep` returns how many entries it removed. Must be called from
    /// within a Tokio runtime.
    pub fn spawn<F>(name: &'static str, interval: Duration, sweep: F) -> Self
    where
        F: Fn() -> usize + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep();
                        if removed > 0 {
                            debug!(sweeper = name, removed = removed, "Swept expired entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!(sweeper = name, "Sweeper stopped");
        });

        info!(sweeper = name, interval_ms = interval.as_millis() as u64, "Sweeper started");

        Self {
            shutdown: shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
