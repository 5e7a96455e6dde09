//! Background key refresh.
//!
//! A cancellable task that wakes on a fixed synchronization interval and
//! asks the server to refresh its key. Most wakeups are synchronizing
//! (adopt-newer-only); once the rollover interval has elapsed since the
//! last successful refresh, the wakeup performs a full rollover. Failures
//! shorten the next wait to the error-retry interval — this retry loop is
//! the only place in the system that swallows an error.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::server::Server;

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// How often to synchronize with the key store.
    pub sync_interval: Duration,
    /// Age after which a wakeup rolls the key over instead of only
    /// synchronizing.
    pub rollover_interval: Duration,
    /// Wait before retrying after a failed refresh.
    pub error_retry_interval: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60 * 60),
            rollover_interval: Duration::from_secs(24 * 60 * 60),
            error_retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Handle to the background refresh task.
pub struct KeyRefresher {
    cancel: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl KeyRefresher {
    pub fn spawn(server: Arc<Server>, config: RefresherConfig) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut wait = config.sync_interval;
            loop {
                tokio::select! {
                    _ = cancelled.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let age = SystemTime::now()
                    .duration_since(server.last_key_refresh().await)
                    .unwrap_or(Duration::ZERO);
                let sync_only = age < config.rollover_interval;

                match server.refresh_key(sync_only).await {
                    Ok(true) => {
                        tracing::info!(sync_only, "key refreshed");
                        wait = config.sync_interval;
                    }
                    Ok(false) => {
                        tracing::info!("key up to date, not refreshed");
                        wait = config.sync_interval;
                    }
                    Err(e) => {
                        tracing::error!("key refresh failed, will retry shortly: {}", e);
                        wait = config.error_retry_interval;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop the task. The wait primitive wakes immediately; this resolves
    /// as soon as any in-flight refresh completes.
    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}
