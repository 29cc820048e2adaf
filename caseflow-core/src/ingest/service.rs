use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::IngestionPipeline;
use super::queue::{Fingerprint, ObservationQueue, Settlement};
use super::reconcile::{ReconcileReport, reconcile_inbox};
use super::watch::InboxWatcher;
use super::{IngestConfig, IngestOutcome, PathFilter};
use crate::error::{IntakeError, Result};

/// Long-lived owner of the inbox feeds and the drain loop.
pub struct IngestionService {
    inbox: PathBuf,
    config: IngestConfig,
    pipeline: Arc<IngestionPipeline>,
    queue: Arc<ObservationQueue>,
    filter: PathFilter,
    rescan: Arc<Notify>,
    shutdown_token: CancellationToken,
    watcher: Mutex<Option<InboxWatcher>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("IngestionService")
            .field("inbox", &self.inbox)
            .field("config", &self.config)
            .field("pending", &self.queue.pending_len())
            .field("retrying", &self.queue.retry_len())
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl IngestionService {
    pub fn new(
        inbox: impl Into<PathBuf>,
        config: IngestConfig,
        pipeline: IngestionPipeline,
    ) -> Self {
        let queue = Arc::new(ObservationQueue::new(config.retry));
        let filter = PathFilter::from_config(&config);
        Self {
            inbox: inbox.into(),
            config,
            pipeline: Arc::new(pipeline),
            queue,
            filter,
            rescan: Arc::new(Notify::new()),
            shutdown_token: CancellationToken::new(),
            watcher: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<ObservationQueue> {
        Arc::clone(&self.queue)
    }

    pub fn pipeline(&self) -> Arc<IngestionPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Create the inbox, spawn the drain and reconcile loops and install the
    /// watcher. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shutdown_token.is_cancelled() {
            return Err(IntakeError::Internal(
                "ingestion service already stopped".into(),
            ));
        }

        tokio::fs::create_dir_all(&self.inbox).await.map_err(|err| {
            IntakeError::StorageUnavailable(format!(
                "failed to create inbox {:?}: {err}",
                self.inbox
            ))
        })?;
        self.pipeline.store().ensure_root().await?;

        {
            let mut handles = self.worker_handles.lock().await;
            handles.push(self.spawn_drain_loop());
            handles.push(self.spawn_reconcile_loop());
        }

        // The reconcile loop alone is enough for correctness, so a watcher
        // failure only costs latency.
        match InboxWatcher::start(
            &self.inbox,
            self.filter.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.rescan),
        )
        .await
        {
            Ok(watcher) => {
                *self.watcher.lock().await = Some(watcher);
            }
            Err(err) => {
                warn!(
                    target: "ingest::watch",
                    inbox = %self.inbox.display(),
                    error = %err,
                    "inbox watcher unavailable; relying on reconciliation"
                );
            }
        }

        info!(
            target: "ingest::pipeline",
            inbox = %self.inbox.display(),
            store = %self.pipeline.store().root().display(),
            "ingestion service started"
        );
        Ok(())
    }

    /// Stop accepting observations, let the in-flight batch finish and join
    /// the background tasks.
    pub async fn stop(&self) {
        info!(target: "ingest::pipeline", "stopping ingestion service");

        self.queue.close();
        self.watcher.lock().await.take();
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "ingest::pipeline", error = %err, "ingestion task failed");
            }
        }

        info!(target: "ingest::pipeline", "ingestion service stopped");
    }

    /// Run the pipeline for one path right away. A path another writer holds
    /// is queued instead and reported as [`IngestOutcome::Deferred`].
    pub async fn ingest_now(&self, path: &Path) -> Result<IngestOutcome> {
        if self.queue.is_closed() {
            return Err(IntakeError::Internal(
                "ingestion service stopped".into(),
            ));
        }
        if !self.queue.begin(path) {
            self.queue.observe(path);
            return Ok(IngestOutcome::Deferred);
        }
        let (outcome, fingerprint) = self.pipeline.process_observed(path).await;
        settle(&self.queue, path, &outcome, fingerprint);
        Ok(outcome)
    }

    /// One reconciliation walk, queueing new or changed files.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        run_reconcile(
            self.inbox.clone(),
            self.filter.clone(),
            self.config.follow_links,
            Arc::clone(&self.queue),
        )
        .await
    }

    /// Process whatever is queued or due, returning how many paths ran.
    pub async fn drain_once(&self) -> usize {
        drain_batch(&self.pipeline, &self.queue).await
    }

    fn spawn_drain_loop(&self) -> JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown_token.clone();
        let idle = self.config.idle_interval();

        tokio::spawn(async move {
            loop {
                let processed = drain_batch(&pipeline, &queue).await;
                if shutdown.is_cancelled() {
                    break;
                }
                if processed > 0 {
                    continue;
                }

                let wait = queue
                    .next_retry_in()
                    .map_or(idle, |due| due.min(idle))
                    .max(Duration::from_millis(1));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            debug!(target: "ingest::pipeline", "drain loop exited");
        })
    }

    fn spawn_reconcile_loop(&self) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        let filter = self.filter.clone();
        let follow_links = self.config.follow_links;
        let queue = Arc::clone(&self.queue);
        let rescan = Arc::clone(&self.rescan);
        let shutdown = self.shutdown_token.clone();
        let period = self.config.reconcile_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = rescan.notified() => {}
                }
                if let Err(err) = run_reconcile(
                    inbox.clone(),
                    filter.clone(),
                    follow_links,
                    Arc::clone(&queue),
                )
                .await
                {
                    warn!(target: "ingest::reconcile", error = %err, "reconciliation pass failed");
                }
            }
            debug!(target: "ingest::reconcile", "reconcile loop exited");
        })
    }
}

async fn run_reconcile(
    inbox: PathBuf,
    filter: PathFilter,
    follow_links: bool,
    queue: Arc<ObservationQueue>,
) -> Result<ReconcileReport> {
    tokio::task::spawn_blocking(move || {
        reconcile_inbox(&inbox, &filter, follow_links, &queue)
    })
    .await
    .map_err(|join_err| {
        IntakeError::Internal(format!("reconciliation panicked: {join_err}"))
    })?
}

async fn drain_batch(pipeline: &IngestionPipeline, queue: &ObservationQueue) -> usize {
    let batch = queue.take_batch();
    for path in &batch {
        let (outcome, fingerprint) = pipeline.process_observed(path).await;
        settle(queue, path, &outcome, fingerprint);
    }
    batch.len()
}

fn settle(
    queue: &ObservationQueue,
    path: &Path,
    outcome: &IngestOutcome,
    fingerprint: Option<Fingerprint>,
) {
    let settlement = match outcome {
        IngestOutcome::Ingested { .. }
        | IngestOutcome::Duplicate { .. }
        | IngestOutcome::Rejected { .. } => {
            fingerprint.map_or(Settlement::Forget, Settlement::Settled)
        }
        IngestOutcome::Retry { .. } => Settlement::Retry,
        IngestOutcome::Vanished | IngestOutcome::Deferred => Settlement::Forget,
    };

    if let Some((attempt, delay)) = queue.finish(path, settlement)
        && let IngestOutcome::Retry { stage, error } = outcome
    {
        warn!(
            target: "ingest::pipeline",
            path = %path.display(),
            stage = %stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure; retry scheduled"
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::catalog::{CatalogRepository, InMemoryCatalog};
    use crate::extract::DicomExtractor;
    use crate::extract::dicom::fixture::DicomFixture;
    use crate::store::ContentStore;

    fn service(dir: &TempDir, catalog: &InMemoryCatalog, config: IngestConfig) -> IngestionService {
        let pipeline = IngestionPipeline::new(
            Arc::new(DicomExtractor::new()),
            ContentStore::new(dir.path().join("store")),
            Arc::new(catalog.clone()),
        );
        IngestionService::new(dir.path().join("inbox"), config, pipeline)
    }

    #[tokio::test]
    async fn ingest_now_catalogs_and_settles_the_path() {
        let dir = TempDir::new().unwrap();
        let catalog = InMemoryCatalog::new();
        let svc = service(&dir, &catalog, IngestConfig::default());
        std::fs::create_dir_all(svc.inbox()).unwrap();
        let path = svc.inbox().join("a.dcm");
        std::fs::write(&path, DicomFixture::new("C1", "I1").to_bytes()).unwrap();

        let outcome = svc.ingest_now(&path).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested { .. }));
        assert!(svc.queue().is_settled(&path));

        // Unchanged files are skipped by reconciliation.
        let report = svc.reconcile_now().await.unwrap();
        assert_eq!(report.seen, 1);
        assert_eq!(report.enqueued, 0);
    }

    #[tokio::test]
    async fn ingest_now_defers_paths_held_by_another_writer() {
        let dir = TempDir::new().unwrap();
        let catalog = InMemoryCatalog::new();
        let svc = service(&dir, &catalog, IngestConfig::default());
        let path = svc.inbox().join("a.dcm");

        assert!(svc.queue().begin(&path));
        let outcome = svc.ingest_now(&path).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred);
    }

    #[tokio::test]
    async fn fixed_rejected_file_is_picked_up_again() {
        let dir = TempDir::new().unwrap();
        let catalog = InMemoryCatalog::new();
        let svc = service(&dir, &catalog, IngestConfig::default());
        std::fs::create_dir_all(svc.inbox()).unwrap();
        let path = svc.inbox().join("a.dcm");

        std::fs::write(&path, b"garbage").unwrap();
        svc.reconcile_now().await.unwrap();
        assert_eq!(svc.drain_once().await, 1);
        assert_eq!(catalog.case_count(), 0);
        assert!(svc.queue().is_settled(&path));

        std::fs::write(&path, DicomFixture::new("C1", "I1").to_bytes()).unwrap();
        let report = svc.reconcile_now().await.unwrap();
        assert_eq!(report.enqueued, 1);
        svc.drain_once().await;
        assert_eq!(catalog.case_count(), 1);
    }

    #[tokio::test]
    async fn running_service_drains_files_dropped_before_start() {
        let dir = TempDir::new().unwrap();
        let catalog = InMemoryCatalog::new();
        let config = IngestConfig {
            idle_interval_ms: 10,
            reconcile_interval_ms: 50,
            ..IngestConfig::default()
        };
        let svc = service(&dir, &catalog, config);
        std::fs::create_dir_all(svc.inbox()).unwrap();
        for (name, sop) in [("a.dcm", "I1"), ("b.dcm", "I2")] {
            std::fs::write(
                svc.inbox().join(name),
                DicomFixture::new("C1", sop).to_bytes(),
            )
            .unwrap();
        }

        svc.start().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while catalog.item_count() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        svc.stop().await;

        assert_eq!(catalog.item_count(), 2);
        assert_eq!(catalog.work_item_count(), 1);
        let case = catalog
            .find_case_by_id(&caseflow_model::CaseId::new("C1").unwrap())
            .await
            .unwrap();
        assert!(case.is_some());
        assert!(
            svc.ingest_now(&svc.inbox().join("a.dcm"))
                .await
                .is_err()
        );
    }
}
