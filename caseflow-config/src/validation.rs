use std::path::{Component, Path, PathBuf};

use caseflow_core::lease::MAX_LEASE_DURATION_SECS;
use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("lease duration must be positive (got {secs}s)")]
    NonPositiveLease { secs: i64 },
    #[error("lease duration {secs}s exceeds the maximum of {max}s")]
    LeaseTooLong { secs: i64, max: i64 },
    #[error("{first_name} {first:?} and {second_name} {second:?} overlap")]
    OverlappingPaths {
        first_name: &'static str,
        first: PathBuf,
        second_name: &'static str,
        second: PathBuf,
    },
    #[error("at least one ingest extension is required unless extensionless files are included")]
    NoIngestFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Reject configurations that cannot work and collect ones that merely look
/// suspicious.
pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.lease.lease_duration_secs <= 0 {
        return Err(ConfigGuardRailError::NonPositiveLease {
            secs: config.lease.lease_duration_secs,
        });
    }
    if config.lease.lease_duration_secs > MAX_LEASE_DURATION_SECS {
        return Err(ConfigGuardRailError::LeaseTooLong {
            secs: config.lease.lease_duration_secs,
            max: MAX_LEASE_DURATION_SECS,
        });
    }

    // The watcher must never see the service's own copies.
    let paths = &config.paths;
    for (first_name, first, second_name, second) in [
        ("inbox", &paths.inbox, "store", &paths.store),
        ("inbox", &paths.inbox, "render_cache", &paths.render_cache),
    ] {
        if overlaps(first, second) {
            return Err(ConfigGuardRailError::OverlappingPaths {
                first_name,
                first: first.clone(),
                second_name,
                second: second.clone(),
            });
        }
    }

    let ingest = &config.ingest;
    if ingest
        .extensions
        .iter()
        .all(|ext| ext.trim_start_matches('.').trim().is_empty())
        && !ingest.include_extensionless
    {
        return Err(ConfigGuardRailError::NoIngestFilter);
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database URL configured",
            "Set DATABASE_URL or [database].url, or run with --ephemeral",
        );
    }
    if ingest.idle_interval_ms == 0 {
        warnings.push("ingest.idle_interval_ms is 0; the drain loop will poll continuously");
    }
    if ingest.retry.backoff_base_ms > ingest.retry.backoff_max_ms {
        warnings.push("ingest.retry.backoff_base_ms exceeds backoff_max_ms; every retry waits backoff_max_ms");
    }

    Ok(warnings)
}

fn overlaps(a: &Path, b: &Path) -> bool {
    let a = absolute_lexical(a);
    let b = absolute_lexical(b);
    a.starts_with(&b) || b.starts_with(&a)
}

/// Absolute path with `.` and `..` resolved lexically; the directories may
/// not exist yet.
fn absolute_lexical(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut clean = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }
    clean
}
