use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use super::config::RetryConfig;

/// Cheap change detector for settled files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// How a processed path leaves the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Nothing more to do until the file changes.
    Settled(Fingerprint),
    /// Transient failure; schedule another attempt.
    Retry,
    /// The file is gone.
    Forget,
}

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    attempt: u32,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    retries: HashMap<PathBuf, RetryEntry>,
    in_flight: HashSet<PathBuf>,
    /// Observed again while in flight; requeued when the writer finishes.
    rerun: HashSet<PathBuf>,
    settled: HashMap<PathBuf, Fingerprint>,
    closed: bool,
}

/// The only in-process shared structure of the ingestion side.
///
/// Paths are deduplicated while pending, and a path is never handed to two
/// writers at once.
#[derive(Debug)]
pub struct ObservationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    retry: RetryConfig,
}

impl ObservationQueue {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            retry,
        }
    }

    /// Queue a path. Returns false when the queue is closed or the path is
    /// already waiting.
    pub fn observe(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.in_flight.contains(&path) {
            return state.rerun.insert(path);
        }
        if state.queued.contains(&path) || state.retries.contains_key(&path) {
            return false;
        }
        state.queued.insert(path.clone());
        state.pending.push_back(path);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Queue a path unless it already settled with the same fingerprint.
    pub fn observe_if_changed(
        &self,
        path: impl Into<PathBuf>,
        fingerprint: Fingerprint,
    ) -> bool {
        let path = path.into();
        if self.state.lock().settled.get(&path) == Some(&fingerprint) {
            return false;
        }
        self.observe(path)
    }

    /// Move every pending path and every due retry into the in-flight set.
    pub fn take_batch(&self) -> Vec<PathBuf> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut batch: Vec<PathBuf> = Vec::with_capacity(state.pending.len());

        while let Some(path) = state.pending.pop_front() {
            state.queued.remove(&path);
            batch.push(path);
        }

        let due: Vec<PathBuf> = state
            .retries
            .iter()
            .filter(|(path, entry)| {
                entry.ready_at <= now && !state.in_flight.contains(*path)
            })
            .map(|(path, _)| path.clone())
            .collect();
        batch.extend(due);

        for path in &batch {
            state.in_flight.insert(path.clone());
        }
        batch
    }

    /// Claim a single path for immediate processing. Returns false when
    /// another writer holds it.
    pub fn begin(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        if state.in_flight.contains(path) {
            return false;
        }
        if state.queued.remove(path) {
            state.pending.retain(|queued| queued != path);
        }
        state.in_flight.insert(path.to_path_buf());
        true
    }

    /// Release an in-flight path. For `Retry` the returned value is the
    /// attempt number and the delay before it runs.
    pub fn finish(
        &self,
        path: &Path,
        settlement: Settlement,
    ) -> Option<(u32, Duration)> {
        let mut state = self.state.lock();
        state.in_flight.remove(path);

        let scheduled = match settlement {
            Settlement::Settled(fingerprint) => {
                state.retries.remove(path);
                state.settled.insert(path.to_path_buf(), fingerprint);
                None
            }
            Settlement::Forget => {
                state.retries.remove(path);
                state.settled.remove(path);
                None
            }
            Settlement::Retry => {
                let attempt = state
                    .retries
                    .get(path)
                    .map(|entry| entry.attempt + 1)
                    .unwrap_or(1);
                let delay = self.retry.delay_for(attempt);
                state.settled.remove(path);
                state.retries.insert(
                    path.to_path_buf(),
                    RetryEntry {
                        attempt,
                        ready_at: Instant::now() + delay,
                    },
                );
                Some((attempt, delay))
            }
        };

        let requeue = state.rerun.remove(path)
            && !state.closed
            && !state.retries.contains_key(path);
        if requeue {
            state.queued.insert(path.to_path_buf());
            state.pending.push_back(path.to_path_buf());
        }
        drop(state);
        if requeue {
            self.notify.notify_one();
        }
        scheduled
    }

    /// Time until the earliest scheduled retry, if any.
    pub fn next_retry_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .retries
            .values()
            .map(|entry| entry.ready_at.saturating_duration_since(now))
            .min()
    }

    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Stop accepting observations. Already queued paths stay queued.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn retry_len(&self) -> usize {
        self.state.lock().retries.len()
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.state.lock().in_flight.contains(path)
    }

    pub fn is_settled(&self, path: &Path) -> bool {
        self.state.lock().settled.contains_key(path)
    }

    pub fn settled_len(&self) -> usize {
        self.state.lock().settled.len()
    }

    /// Forget settled fingerprints for paths not in `present`. Returns how
    /// many were dropped.
    pub fn prune_settled(&self, present: &HashSet<PathBuf>) -> usize {
        let mut state = self.state.lock();
        let before = state.settled.len();
        state.settled.retain(|path, _| present.contains(path));
        before - state.settled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(len: u64) -> Fingerprint {
        Fingerprint {
            len,
            modified: None,
        }
    }

    fn queue() -> ObservationQueue {
        ObservationQueue::new(RetryConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        })
    }

    #[test]
    fn pending_paths_are_deduplicated_in_order() {
        let q = queue();
        assert!(q.observe("/in/a.dcm"));
        assert!(q.observe("/in/b.dcm"));
        assert!(!q.observe("/in/a.dcm"));
        assert_eq!(
            q.take_batch(),
            vec![PathBuf::from("/in/a.dcm"), PathBuf::from("/in/b.dcm")]
        );
        assert!(q.take_batch().is_empty());
    }

    #[test]
    fn in_flight_paths_have_one_writer() {
        let q = queue();
        let path = Path::new("/in/a.dcm");
        assert!(q.begin(path));
        assert!(!q.begin(path));

        // Observed while in flight: picked up again after the writer is done.
        assert!(q.observe(path));
        assert!(q.take_batch().is_empty());
        q.finish(path, Settlement::Settled(fp(1)));
        assert_eq!(q.take_batch(), vec![path.to_path_buf()]);
    }

    #[test]
    fn settled_files_are_skipped_until_they_change() {
        let q = queue();
        let path = PathBuf::from("/in/a.dcm");
        q.observe(path.clone());
        q.take_batch();
        q.finish(&path, Settlement::Settled(fp(10)));

        assert!(!q.observe_if_changed(path.clone(), fp(10)));
        assert!(q.observe_if_changed(path.clone(), fp(11)));
    }

    #[test]
    fn pruning_drops_only_absent_settled_paths() {
        let q = queue();
        for name in ["/in/a.dcm", "/in/b.dcm"] {
            q.observe(name);
        }
        for path in q.take_batch() {
            q.finish(&path, Settlement::Settled(fp(5)));
        }
        assert_eq!(q.settled_len(), 2);

        let present: HashSet<PathBuf> = [PathBuf::from("/in/a.dcm")].into();
        assert_eq!(q.prune_settled(&present), 1);
        assert!(q.is_settled(Path::new("/in/a.dcm")));
        assert!(!q.is_settled(Path::new("/in/b.dcm")));

        // Same metadata as before, but the entry is gone so it is queued.
        assert!(q.observe_if_changed("/in/b.dcm", fp(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially() {
        let q = queue();
        let path = PathBuf::from("/in/a.dcm");
        q.observe(path.clone());
        q.take_batch();

        assert_eq!(
            q.finish(&path, Settlement::Retry),
            Some((1, Duration::from_millis(100)))
        );
        assert!(q.take_batch().is_empty());
        assert!(!q.observe(path.clone()));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(q.take_batch(), vec![path.clone()]);
        assert_eq!(
            q.finish(&path, Settlement::Retry),
            Some((2, Duration::from_millis(200)))
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        q.take_batch();
        q.finish(&path, Settlement::Settled(fp(1)));
        assert_eq!(q.retry_len(), 0);
    }

    #[test]
    fn closed_queue_rejects_observations() {
        let q = queue();
        q.close();
        assert!(!q.observe("/in/a.dcm"));
        assert!(q.is_closed());
        assert_eq!(q.pending_len(), 0);
    }
}
