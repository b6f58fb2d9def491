//! Reachability probing with a recency guard.
//!
//! Probes can overlap: a slow probe may still be in flight when a newer one
//! starts and reports. Each probe takes a monotonically increasing sequence
//! number at start, and only the most recently started probe is allowed to
//! report; earlier completions are discarded so a stale "unreachable" cannot
//! overwrite a fresher "healthy". Recency is deliberately judged by start
//! order rather than completion order: a probe that resolves last but was
//! sampled earlier carries older evidence about the network, so it loses to
//! any later-started probe that has already reported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::capabilities::api::RemoteApi;

pub struct ConnectivityMonitor {
    api: Arc<dyn RemoteApi>,
    probe_timeout: Duration,
    started: AtomicU64,
    reported: AtomicU64,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>, probe_timeout: Duration) -> Self {
        Self {
            api,
            probe_timeout,
            started: AtomicU64::new(0),
            reported: AtomicU64::new(0),
        }
    }

    /// Run one bounded health probe. `Some(true)` means the backend answered,
    /// `Some(false)` means transport failure or timeout, `None` means a probe
    /// started after this one already reported and this result is stale.
    pub async fn check(&self) -> Option<bool> {
        let seq = self.started.fetch_add(1, Ordering::SeqCst) + 1;

        let healthy = match tokio::time::timeout(self.probe_timeout, self.api.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(seq, error = %err, "health probe failed");
                false
            }
            Err(_) => {
                debug!(seq, timeout_ms = self.probe_timeout.as_millis() as u64, "health probe timed out");
                false
            }
        };

        let newest_reported = self.reported.fetch_max(seq, Ordering::SeqCst);
        if newest_reported >= seq {
            debug!(seq, newest_reported, "probe result superseded, discarding");
            return None;
        }
        Some(healthy)
    }
}
