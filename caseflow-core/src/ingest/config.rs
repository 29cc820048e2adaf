use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the ingestion service.
///
/// All fields carry defaults so a deployment only needs to name what it
/// changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Idle wait between drain passes when nothing is queued (ms).
    pub idle_interval_ms: u64,
    /// Cadence of the full inbox reconciliation walk (ms).
    pub reconcile_interval_ms: u64,
    /// Backoff for transient store/catalog failures.
    pub retry: RetryConfig,
    /// Lowercase file extensions (without the dot) that are ingested.
    pub extensions: Vec<String>,
    /// Also consider files without any extension.
    pub include_extensionless: bool,
    /// Follow symlinks during reconciliation walks.
    pub follow_links: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 2_000,
            reconcile_interval_ms: 60_000,
            retry: RetryConfig::default(),
            extensions: vec!["dcm".to_string()],
            include_extensionless: false,
            follow_links: false,
        }
    }
}

impl IngestConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// `base * 2^(attempt - 1)`, capped at `backoff_max`. Attempts start at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let delay_ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let retry = RetryConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: IngestConfig =
            serde_json::from_str(r#"{ "idle_interval_ms": 50 }"#).unwrap();
        assert_eq!(cfg.idle_interval_ms, 50);
        assert_eq!(cfg.extensions, vec!["dcm".to_string()]);
        assert_eq!(cfg.retry, RetryConfig::default());
    }
}
