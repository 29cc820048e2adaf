//! Catalog repository: transactional CRUD over cases, items and work items.
//!
//! The repository owns every uniqueness invariant. Duplicate creation is a
//! designed path (compare-and-create), never an error bubbled from the
//! database: a racing `create_case_with_work_item` returns the winner's case,
//! and `create_item` reports [`IntakeError::DuplicateItem`] which callers
//! treat as "already ingested".
//!
//! [`IntakeError::DuplicateItem`]: crate::error::IntakeError::DuplicateItem

pub mod memory;
pub mod postgres;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use caseflow_model::{
    Case, CaseId, Item, ItemId, NewCase, NewItem, WorkItem, WorkItemId, WorkerId,
};
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{IntakeError, Result};

pub use memory::InMemoryCatalog;
pub use postgres::PostgresCatalog;

/// Result of compare-and-create on a case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseRegistration {
    pub case: Case,
    pub work_item: WorkItem,
    /// False when another caller created the case first.
    pub created: bool,
}

/// Expiry for a lease taken at `now`. Fails instead of overflowing.
pub(crate) fn lease_expiry(
    now: DateTime<Utc>,
    lease_duration: TimeDelta,
) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lease_duration).ok_or_else(|| {
        IntakeError::Internal(format!(
            "lease of {}s from {now} is out of range",
            lease_duration.num_seconds()
        ))
    })
}

#[async_trait]
pub trait CatalogRepository: Send + Sync + fmt::Debug {
    async fn find_case_by_id(&self, case_id: &CaseId) -> Result<Option<Case>>;

    /// Atomically create a case and its single queued work item, or return
    /// the existing pair when the case already exists.
    async fn create_case_with_work_item(
        &self,
        case: NewCase,
    ) -> Result<CaseRegistration>;

    async fn find_item_by_sop_like_id(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<Item>>;

    /// Fails with `DuplicateItem` when the item id is already cataloged.
    async fn create_item(&self, item: NewItem) -> Result<Item>;

    /// Move every locked work item whose lease expired before `now` back to
    /// queued. Returns how many were reclaimed.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Lock the oldest queued work item for `worker`.
    async fn acquire_next(
        &self,
        worker: &WorkerId,
        lease_duration: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    /// Locked -> Completed, only for the current owner.
    async fn complete(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool>;

    /// Locked -> Queued, only for the current owner.
    async fn release(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool>;

    /// Locked -> NeedsReview, only for the current owner.
    async fn flag_for_review(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool>;

    async fn find_work_item(
        &self,
        work_item_id: WorkItemId,
    ) -> Result<Option<WorkItem>>;

    async fn work_item_for_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Option<WorkItem>>;

    /// Items of a case ordered by ordinal number.
    async fn items_for_case(&self, case_id: &CaseId) -> Result<Vec<Item>>;

    async fn set_render_cache_path(
        &self,
        item_id: &ItemId,
        path: &Path,
    ) -> Result<bool>;
}
