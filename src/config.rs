use std::time::Duration;

use crate::error::CoreError;
use crate::{
    CHECK_INTERVAL_MS, GRACE_PERIOD_MS, MAX_PENDING_OPERATIONS, PROBE_TIMEOUT_MS,
    STARTUP_SETTLE_MS,
};

/// Policy knobs for the sync core. Defaults match the shipped product
/// policy; `validate` guards against nonsensical overrides from the shell.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Length of the offline grace window, in milliseconds.
    pub grace_period_ms: u64,
    /// Deadline for a single reachability probe.
    pub probe_timeout_ms: u64,
    /// Interval between scheduled reachability checks.
    pub check_interval_ms: u64,
    /// Settle delay before the eager startup check.
    pub startup_settle_ms: u64,
    /// Cap on the pending-operation queue; oldest entries are evicted first.
    pub max_pending_operations: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: GRACE_PERIOD_MS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            check_interval_ms: CHECK_INTERVAL_MS,
            startup_settle_ms: STARTUP_SETTLE_MS,
            max_pending_operations: MAX_PENDING_OPERATIONS,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.grace_period_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "grace_period_ms must be > 0".into(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "probe_timeout_ms must be > 0".into(),
            ));
        }
        if self.check_interval_ms < self.probe_timeout_ms {
            return Err(CoreError::InvalidConfig(
                "check_interval_ms must be at least probe_timeout_ms".into(),
            ));
        }
        if self.max_pending_operations == 0 {
            return Err(CoreError::InvalidConfig(
                "max_pending_operations must be > 0".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }
}
