use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Longest lease a deployment may configure (seven days).
pub const MAX_LEASE_DURATION_SECS: i64 = 7 * 24 * 60 * 60;

/// Lease tuning for annotator work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Fixed lease length; leases are never renewed mid-task.
    pub lease_duration_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 30 * 60,
        }
    }
}

impl LeaseConfig {
    /// Saturates at [`TimeDelta::MAX`] for values chrono cannot represent;
    /// the catalog rejects expiries that overflow.
    pub fn lease_duration(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.lease_duration_secs).unwrap_or(TimeDelta::MAX)
    }
}
