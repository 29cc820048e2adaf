use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use caseflow_model::{
    Case, CaseId, Item, ItemId, Lease, NewCase, NewItem, WorkItem, WorkItemId,
    WorkItemState, WorkerId,
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{CaseRegistration, CatalogRepository, lease_expiry};
use crate::error::{IntakeError, Result};

#[derive(Debug, Default)]
struct Tables {
    cases: HashMap<CaseId, Case>,
    items: HashMap<ItemId, Item>,
    work_items: HashMap<WorkItemId, WorkItem>,
    work_item_by_case: HashMap<CaseId, WorkItemId>,
}

/// Process-local catalog. One mutex guards every table, so each operation is
/// serializable with respect to all others.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case_count(&self) -> usize {
        self.tables.lock().cases.len()
    }

    pub fn item_count(&self) -> usize {
        self.tables.lock().items.len()
    }

    pub fn work_item_count(&self) -> usize {
        self.tables.lock().work_items.len()
    }

    fn transition_owned(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
        to: WorkItemState,
    ) -> bool {
        let mut tables = self.tables.lock();
        let Some(work_item) = tables.work_items.get_mut(&work_item_id) else {
            return false;
        };
        if !work_item.is_owned_by(worker) {
            return false;
        }
        work_item.state = to;
        work_item.lease = None;
        work_item.updated_at = Utc::now();
        true
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn find_case_by_id(&self, case_id: &CaseId) -> Result<Option<Case>> {
        Ok(self.tables.lock().cases.get(case_id).cloned())
    }

    async fn create_case_with_work_item(
        &self,
        case: NewCase,
    ) -> Result<CaseRegistration> {
        let mut tables = self.tables.lock();

        if let Some(existing) = tables.cases.get(&case.case_id).cloned() {
            let work_item = tables
                .work_item_by_case
                .get(&existing.case_id)
                .and_then(|id| tables.work_items.get(id))
                .cloned()
                .ok_or_else(|| {
                    IntakeError::Internal(format!(
                        "case {} has no work item",
                        existing.case_id
                    ))
                })?;
            debug!(target: "catalog", case_id = %existing.case_id, "case already registered");
            return Ok(CaseRegistration {
                case: existing,
                work_item,
                created: false,
            });
        }

        let now = Utc::now();
        let case = case.into_case(now);
        let work_item = WorkItem::queued(case.case_id.clone(), now);

        tables
            .work_item_by_case
            .insert(case.case_id.clone(), work_item.work_item_id);
        tables
            .work_items
            .insert(work_item.work_item_id, work_item.clone());
        tables.cases.insert(case.case_id.clone(), case.clone());

        Ok(CaseRegistration {
            case,
            work_item,
            created: true,
        })
    }

    async fn find_item_by_sop_like_id(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<Item>> {
        Ok(self.tables.lock().items.get(item_id).cloned())
    }

    async fn create_item(&self, item: NewItem) -> Result<Item> {
        let mut tables = self.tables.lock();
        if tables.items.contains_key(&item.item_id) {
            return Err(IntakeError::DuplicateItem(item.item_id));
        }
        if !tables.cases.contains_key(&item.case_id) {
            return Err(IntakeError::NotFound(format!("case {}", item.case_id)));
        }
        let item = item.into_item(Utc::now());
        tables.items.insert(item.item_id.clone(), item.clone());
        Ok(item)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock();
        let mut reclaimed = 0u64;
        for work_item in tables.work_items.values_mut() {
            let expired = work_item.state == WorkItemState::Locked
                && work_item
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.is_expired_at(now));
            if expired {
                work_item.state = WorkItemState::Queued;
                work_item.lease = None;
                work_item.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn acquire_next(
        &self,
        worker: &WorkerId,
        lease_duration: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut tables = self.tables.lock();
        let next_id = tables
            .work_items
            .values()
            .filter(|w| w.state == WorkItemState::Queued)
            .min_by_key(|w| (w.created_at, w.work_item_id))
            .map(|w| w.work_item_id);

        let Some(next_id) = next_id else {
            return Ok(None);
        };
        let expires_at = lease_expiry(now, lease_duration)?;
        let Some(work_item) = tables.work_items.get_mut(&next_id) else {
            return Ok(None);
        };
        work_item.state = WorkItemState::Locked;
        work_item.lease = Some(Lease {
            owner_id: worker.clone(),
            expires_at,
        });
        work_item.updated_at = now;
        Ok(Some(work_item.clone()))
    }

    async fn complete(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        Ok(self.transition_owned(work_item_id, worker, WorkItemState::Completed))
    }

    async fn release(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        Ok(self.transition_owned(work_item_id, worker, WorkItemState::Queued))
    }

    async fn flag_for_review(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        Ok(self.transition_owned(
            work_item_id,
            worker,
            WorkItemState::NeedsReview,
        ))
    }

    async fn find_work_item(
        &self,
        work_item_id: WorkItemId,
    ) -> Result<Option<WorkItem>> {
        Ok(self.tables.lock().work_items.get(&work_item_id).cloned())
    }

    async fn work_item_for_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Option<WorkItem>> {
        let tables = self.tables.lock();
        Ok(tables
            .work_item_by_case
            .get(case_id)
            .and_then(|id| tables.work_items.get(id))
            .cloned())
    }

    async fn items_for_case(&self, case_id: &CaseId) -> Result<Vec<Item>> {
        let tables = self.tables.lock();
        let mut items: Vec<Item> = tables
            .items
            .values()
            .filter(|item| &item.case_id == case_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.ordinal_number
                .cmp(&b.ordinal_number)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Ok(items)
    }

    async fn set_render_cache_path(
        &self,
        item_id: &ItemId,
        path: &Path,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.items.get_mut(item_id) {
            Some(item) => {
                item.render_cache_path = Some(path.to_path_buf());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
