use std::env;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use super::PathFilter;
use super::queue::ObservationQueue;
use crate::error::{IntakeError, Result};

/// What a raw notification means for the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchSignal {
    Candidate(PathBuf),
    /// Events may have been dropped; only a full scan can recover.
    Rescan,
    Ignore,
}

/// Low-latency feed of candidate paths. Dropping it stops the watch.
#[derive(Debug)]
pub struct InboxWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl InboxWatcher {
    /// Watch `root` recursively, queueing every accepted path that is created
    /// or written. Overflow and watcher errors poke `rescan`.
    pub async fn start(
        root: &Path,
        filter: PathFilter,
        queue: Arc<ObservationQueue>,
        rescan: Arc<Notify>,
    ) -> Result<Self> {
        let root = resolve_root(root);
        let watch_root = root.clone();
        let watcher = spawn_blocking(move || init_watcher(watch_root, filter, queue, rescan))
            .await
            .map_err(|join_err| {
                IntakeError::Internal(format!(
                    "watcher initialization panicked: {join_err}"
                ))
            })??;

        debug!(target: "ingest::watch", root = %root.display(), "inbox watcher started");
        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn init_watcher(
    root: PathBuf,
    filter: PathFilter,
    queue: Arc<ObservationQueue>,
    rescan: Arc<Notify>,
) -> Result<RecommendedWatcher> {
    let event_root = root.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => match classify_event(&event, &event_root) {
                WatchSignal::Candidate(path) => {
                    if filter.accepts(&path) && queue.observe(path.clone()) {
                        debug!(target: "ingest::watch", path = %path.display(), "path observed");
                    }
                }
                WatchSignal::Rescan => {
                    warn!(target: "ingest::watch", root = %event_root.display(), "watch overflow; scheduling rescan");
                    rescan.notify_one();
                }
                WatchSignal::Ignore => {}
            },
            Err(err) => {
                warn!(
                    target: "ingest::watch",
                    root = %event_root.display(),
                    error = %err,
                    "watcher error; scheduling rescan"
                );
                rescan.notify_one();
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        IntakeError::Internal(format!(
            "failed to create watcher for {}: {}",
            root.display(),
            err
        ))
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|err| {
            IntakeError::Internal(format!("failed to watch {}: {}", root.display(), err))
        })?;

    Ok(watcher)
}

fn classify_event(event: &Event, root: &Path) -> WatchSignal {
    let target = match event.kind {
        EventKind::Other => return WatchSignal::Rescan,
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => event.paths.first(),
        // For a paired rename the destination comes second.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.get(1),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.first(),
        _ => None,
    };

    if event.need_rescan() {
        return WatchSignal::Rescan;
    }

    match target.and_then(|path| sanitize_path(root, path)) {
        Some(path) if path != root => WatchSignal::Candidate(path),
        _ => WatchSignal::Ignore,
    }
}

fn sanitize_path(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            _ => return None,
        }
    }

    let mut normalized = root.to_path_buf();
    normalized.push(clean);
    Some(normalized)
}

fn resolve_root(root: &Path) -> PathBuf {
    if root.is_absolute() {
        return root.to_path_buf();
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join(root)
}
