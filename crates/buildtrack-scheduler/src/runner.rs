//! Tracker runner - drives discovery cycles and shuts the tracker down.

use crate::Tracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, error, info, warn};

/// Timing options for [`TrackerRunner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Time between discovery cycles.
    pub interval: Duration,
    /// How long to wait for running builds on shutdown. `None` skips draining.
    pub drain_timeout: Option<Duration>,
    /// How often to check for running builds while draining.
    pub drain_poll: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            drain_timeout: None,
            drain_poll: Duration::from_millis(100),
        }
    }
}

/// Requests an immediate discovery cycle from a running [`TrackerRunner`].
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    wake: Arc<Notify>,
}

impl RunnerHandle {
    /// Wake the runner. Triggers that arrive while a cycle is in progress
    /// collapse into a single follow-up cycle.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }
}

/// Runs [`Tracker::track`] on every tick and every trigger until shutdown,
/// then drains and releases the engine.
pub struct TrackerRunner {
    tracker: Arc<Tracker>,
    options: RunnerOptions,
    wake: Arc<Notify>,
}

impl TrackerRunner {
    pub fn new(tracker: Arc<Tracker>, options: RunnerOptions) -> Self {
        Self {
            tracker,
            options,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            wake: Arc::clone(&self.wake),
        }
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.options.interval, "Starting build tracker");

        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {
                    debug!("Tracking on demand");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.tracker.track().await {
                error!(error = %e, "Failed to track builds");
            }
        }

        info!("Stopping build tracker");
        self.drain().await;
        self.tracker.release().await;
        info!("Build tracker stopped");
    }

    async fn drain(&self) {
        let Some(timeout) = self.options.drain_timeout else {
            return;
        };
        if !self.tracker.running() {
            return;
        }

        info!(running = self.tracker.running_count(), ?timeout, "Draining running builds");

        let drained = tokio::time::timeout(timeout, async {
            while self.tracker.running() {
                sleep(self.options.drain_poll).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                running = self.tracker.running_count(),
                "Drain timed out, releasing with builds still running"
            );
        }
    }
}
