//! Worker-facing work assignment.
//!
//! Reclamation is lazy: expired leases are returned to the queue only when
//! some worker asks for work. There is no background sweep, so a work item
//! can stay expired-but-locked while nobody calls [`LeaseManager::next`].

mod config;

use std::sync::Arc;

use caseflow_model::{WorkItem, WorkItemId, WorkerId};
use chrono::{TimeDelta, Utc};
use tracing::{debug, info};

pub use config::{LeaseConfig, MAX_LEASE_DURATION_SECS};

use crate::catalog::CatalogRepository;
use crate::error::{IntakeError, Result};

#[derive(Debug, Clone)]
pub struct LeaseManager {
    catalog: Arc<dyn CatalogRepository>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(catalog: Arc<dyn CatalogRepository>, config: LeaseConfig) -> Self {
        Self { catalog, config }
    }

    pub fn lease_duration(&self) -> TimeDelta {
        self.config.lease_duration()
    }

    /// Reclaim expired leases, then lock the oldest queued work item for
    /// `worker`. An empty queue is reported as [`IntakeError::QueueEmpty`].
    pub async fn next(&self, worker: &WorkerId) -> Result<WorkItem> {
        let now = Utc::now();

        let reclaimed = self.catalog.reclaim_expired_leases(now).await?;
        if reclaimed > 0 {
            info!(target: "lease", reclaimed, "reclaimed expired leases");
        }

        match self
            .catalog
            .acquire_next(worker, self.lease_duration(), now)
            .await?
        {
            Some(work_item) => {
                info!(
                    target: "lease",
                    work_item_id = %work_item.work_item_id,
                    case_id = %work_item.case_id,
                    worker_id = %worker,
                    "work item leased"
                );
                Ok(work_item)
            }
            None => {
                debug!(target: "lease", worker_id = %worker, "no queued work");
                Err(IntakeError::QueueEmpty)
            }
        }
    }

    pub async fn complete(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        let accepted = self.catalog.complete(work_item_id, worker).await?;
        self.finish("complete", accepted, work_item_id, worker)
    }

    /// Hand the work item back to the queue before the lease runs out.
    pub async fn release(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        let accepted = self.catalog.release(work_item_id, worker).await?;
        self.finish("release", accepted, work_item_id, worker)
    }

    pub async fn flag_for_review(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        let accepted = self.catalog.flag_for_review(work_item_id, worker).await?;
        self.finish("flag_for_review", accepted, work_item_id, worker)
    }

    // Unknown id, foreign owner and already-finished all look the same to
    // the caller.
    fn finish(
        &self,
        action: &'static str,
        accepted: bool,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        if accepted {
            info!(
                target: "lease",
                action,
                work_item_id = %work_item_id,
                worker_id = %worker,
                "work item transitioned"
            );
            Ok(())
        } else {
            debug!(
                target: "lease",
                action,
                work_item_id = %work_item_id,
                worker_id = %worker,
                "transition denied"
            );
            Err(IntakeError::NotFound(format!("work item {work_item_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use caseflow_model::{CaseId, NewCase, WorkItemState};

    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    async fn seed(catalog: &InMemoryCatalog, case: &str) -> WorkItem {
        catalog
            .create_case_with_work_item(NewCase {
                case_id: CaseId::new(case).unwrap(),
                subject_id: None,
                subject_label: None,
                acquisition_date: None,
                free_text_fields: BTreeMap::new(),
                root_path: PathBuf::from("/inbox"),
            })
            .await
            .unwrap()
            .work_item
    }

    fn manager(catalog: &InMemoryCatalog, secs: i64) -> LeaseManager {
        LeaseManager::new(
            Arc::new(catalog.clone()),
            LeaseConfig {
                lease_duration_secs: secs,
            },
        )
    }

    #[tokio::test]
    async fn empty_queue_is_reported() {
        let catalog = InMemoryCatalog::new();
        let err = manager(&catalog, 60).next(&worker("x")).await.unwrap_err();
        assert!(matches!(err, IntakeError::QueueEmpty));
    }

    #[tokio::test]
    async fn denial_does_not_reveal_or_mutate() {
        let catalog = InMemoryCatalog::new();
        let seeded = seed(&catalog, "C1").await;
        let leases = manager(&catalog, 60);

        let leased = leases.next(&worker("x")).await.unwrap();
        assert_eq!(leased.work_item_id, seeded.work_item_id);

        for attempt in [
            leases.complete(seeded.work_item_id, &worker("y")).await,
            leases.release(seeded.work_item_id, &worker("y")).await,
            leases.complete(WorkItemId::new(), &worker("x")).await,
        ] {
            assert!(matches!(attempt, Err(IntakeError::NotFound(_))));
        }

        let current = catalog
            .find_work_item(seeded.work_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.state, WorkItemState::Locked);
        assert_eq!(current.owner_id(), Some(&worker("x")));
    }

    #[tokio::test]
    async fn flag_for_review_clears_lease() {
        let catalog = InMemoryCatalog::new();
        let seeded = seed(&catalog, "C1").await;
        let leases = manager(&catalog, 60);

        leases.next(&worker("x")).await.unwrap();
        leases
            .flag_for_review(seeded.work_item_id, &worker("x"))
            .await
            .unwrap();

        let current = catalog
            .find_work_item(seeded.work_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.state, WorkItemState::NeedsReview);
        assert!(current.lease.is_none());
        assert!(matches!(
            leases.complete(seeded.work_item_id, &worker("x")).await,
            Err(IntakeError::NotFound(_))
        ));
    }
}
