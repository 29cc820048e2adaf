//! Ingestion: inbox observation, the per-file pipeline, and the long-lived
//! service that drains observed paths.
//!
//! Two independent feeds produce candidate paths into one
//! [`ObservationQueue`]: a `notify` watcher (latency) and a periodic
//! `walkdir` reconciliation scan (source of truth). Either alone is enough
//! for correctness. A single drain loop processes queued paths in batches,
//! so each path has at most one writer at a time.

mod config;
mod pipeline;
mod queue;
mod reconcile;
mod service;
mod watch;

use std::fmt;
use std::path::{Path, PathBuf};

use caseflow_model::{CaseId, ItemId};

pub use config::{IngestConfig, RetryConfig};
pub use pipeline::IngestionPipeline;
pub use queue::{Fingerprint, ObservationQueue, Settlement};
pub use reconcile::{ReconcileReport, reconcile_inbox};
pub use service::IngestionService;
pub use watch::InboxWatcher;

/// Progress of one observed file.
///
/// Outcomes carry the last stage the file *reached*: a malformed file stops
/// at `Observed`, a storage failure at `Extracted`, a catalog failure at
/// `Stored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestStage {
    Observed,
    Extracted,
    Stored,
    Cataloged,
    Done,
    Rejected,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Observed => "observed",
            IngestStage::Extracted => "extracted",
            IngestStage::Stored => "stored",
            IngestStage::Cataloged => "cataloged",
            IngestStage::Done => "done",
            IngestStage::Rejected => "rejected",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new item was cataloged.
    Ingested {
        case_id: CaseId,
        item_id: ItemId,
        stored_path: PathBuf,
        case_created: bool,
    },
    /// The item was already cataloged; nothing new was created.
    Duplicate { item_id: ItemId },
    /// Terminal until the file changes on disk.
    Rejected { stage: IngestStage, reason: String },
    /// Transient failure; the path is retried with backoff.
    Retry { stage: IngestStage, error: String },
    /// The file disappeared before it could be read.
    Vanished,
    /// The path was already being processed; it has been queued instead.
    Deferred,
}

impl IngestOutcome {
    /// Stage the file ended in.
    pub fn stage(&self) -> IngestStage {
        match self {
            IngestOutcome::Ingested { .. } | IngestOutcome::Duplicate { .. } => {
                IngestStage::Done
            }
            IngestOutcome::Rejected { .. } => IngestStage::Rejected,
            IngestOutcome::Retry { stage, .. } => *stage,
            IngestOutcome::Vanished | IngestOutcome::Deferred => {
                IngestStage::Observed
            }
        }
    }
}

/// Decides which inbox paths are ingestion candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    extensions: Vec<String>,
    include_extensionless: bool,
}

impl PathFilter {
    pub fn new(extensions: &[String], include_extensionless: bool) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            include_extensionless,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(&config.extensions, config.include_extensionless)
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        // Editor swap files and our own temp files.
        if name.starts_with('.') {
            return false;
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => self.include_extensionless,
        }
    }
}
