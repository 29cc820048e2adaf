use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::PathFilter;
use super::queue::{Fingerprint, ObservationQueue};
use crate::error::{IntakeError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Accepted files found under the inbox.
    pub seen: usize,
    /// Files queued because they are new or changed since they settled.
    pub enqueued: usize,
    /// Settled fingerprints dropped because their file is gone.
    pub pruned: usize,
    pub errors: usize,
}

/// Walk the inbox and queue every accepted file the queue has not settled
/// with its current size and mtime. After a walk without errors, settled
/// fingerprints of files that are no longer there are dropped. Blocking; run
/// it off the runtime.
pub fn reconcile_inbox(
    root: &Path,
    filter: &PathFilter,
    follow_links: bool,
    queue: &ObservationQueue,
) -> Result<ReconcileReport> {
    if !root.is_dir() {
        return Err(IntakeError::NotFound(format!(
            "inbox is not a directory: {}",
            root.display()
        )));
    }

    let mut report = ReconcileReport::default();
    let mut present: HashSet<PathBuf> = HashSet::new();
    for entry in WalkDir::new(root).follow_links(follow_links) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "ingest::reconcile", error = %err, "inbox walk error");
                report.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !filter.accepts(entry.path()) {
            continue;
        }
        report.seen += 1;
        present.insert(entry.path().to_path_buf());

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(
                    target: "ingest::reconcile",
                    path = %entry.path().display(),
                    error = %err,
                    "metadata unavailable"
                );
                report.errors += 1;
                continue;
            }
        };

        if queue.observe_if_changed(entry.path(), Fingerprint::from_metadata(&metadata)) {
            report.enqueued += 1;
        }
    }

    if report.errors == 0 {
        report.pruned = queue.prune_settled(&present);
    }

    debug!(
        target: "ingest::reconcile",
        root = %root.display(),
        seen = report.seen,
        enqueued = report.enqueued,
        pruned = report.pruned,
        errors = report.errors,
        "reconciliation pass finished"
    );
    Ok(report)
}
