use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::{CredentialStore, RefreshCoordinator};

/// Refreshes the session on a fixed cadence so an idle client never lets its
/// access token lapse. Stops when dropped.
pub struct ProactiveRefreshTimer {
    handle: Option<JoinHandle<()>>,
}

impl ProactiveRefreshTimer {
    /// Start ticking. The first refresh happens one `period` from now.
    /// Must be called from within a Tokio runtime.
    pub fn start(refresher: RefreshCoordinator, store: CredentialStore, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !store.has_refresh_token() {
                    debug!("No refresh token stored, skipping proactive refresh");
                    continue;
                }
                // Failures surface on the next real request
                match refresher.refresh().await {
                    Ok(_) => debug!("Proactive refresh succeeded"),
                    Err(e) => debug!(error = %e, "Proactive refresh failed"),
                }
            }
        });
        debug!(period_secs = period.as_secs(), "Proactive refresh timer started");
        Self { handle: Some(handle) }
    }

    /// Stop ticking. An exchange that already started still completes.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Proactive refresh timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ProactiveRefreshTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
