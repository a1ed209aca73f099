//! Build-started notifications via PostgreSQL LISTEN/NOTIFY.

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::DbResult;

/// Channel the `builds` trigger notifies when a build enters `started`.
pub const BUILD_STARTED_CHANNEL: &str = "build_started";

/// Listens for started builds so the tracker does not have to wait for its
/// next tick.
pub struct BuildNotifier {
    pool: PgPool,
    retry_delay: Duration,
}

impl BuildNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_delay: Duration::from_secs(5),
        }
    }

    async fn listen(&self) -> DbResult<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(BUILD_STARTED_CHANNEL).await?;
        Ok(listener)
    }

    /// Call `on_started` for every notification until `shutdown` turns `true`.
    ///
    /// Connection failures are logged and retried; notifications sent while
    /// disconnected are lost, which only delays discovery until the next tick.
    pub async fn run<F>(self, on_started: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn() + Send + Sync,
    {
        info!(channel = BUILD_STARTED_CHANNEL, "Listening for started builds");

        let mut listener = None;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if listener.is_none() {
                let connected = tokio::select! {
                    connected = self.listen() => connected,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                match connected {
                    Ok(connected) => listener = Some(connected),
                    Err(e) => {
                        warn!(error = %e, "Failed to listen for started builds");
                        if self.wait_or_shutdown(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(active) = listener.as_mut() else {
                continue;
            };

            tokio::select! {
                notification = active.recv() => match notification {
                    Ok(notification) => {
                        debug!(build_id = notification.payload(), "Build started");
                        on_started();
                    }
                    Err(e) => {
                        warn!(error = %e, "Lost build notification listener");
                        listener = None;
                        if self.wait_or_shutdown(&mut shutdown).await {
                            break;
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Stopped listening for started builds");
    }

    /// Sleep for the retry delay. Returns `true` if shutdown was requested.
    async fn wait_or_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_delay) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}
