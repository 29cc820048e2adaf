//! Postgres-backed catalog.
//!
//! Compare-and-create relies on `ON CONFLICT DO NOTHING RETURNING`: an empty
//! result means another writer owns the row, and we re-read the winner.
//! Work assignment locks exactly one row via `FOR UPDATE SKIP LOCKED`, so
//! concurrent `acquire_next` callers never receive the same work item.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use caseflow_model::{
    Case, CaseId, ExtractedFields, Item, ItemId, NewCase, NewItem, WorkItem,
    WorkItemId, WorkItemState, WorkerId,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CaseRegistration, CatalogRepository, lease_expiry};
use crate::error::{IntakeError, Result};

const FIFO_INDEX: &str = "idx_work_items_queued_fifo";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const CASE_COLUMNS: &str = "case_id, subject_id, subject_label, acquisition_date, \
     free_text_fields, root_path, created_at";
const ITEM_COLUMNS: &str = "item_id, case_id, ordinal_number, stored_path, frame_count, \
     extracted_fields, render_cache_path, created_at";
const WORK_ITEM_COLUMNS: &str =
    "id, case_id, state, owner_id, lease_expires_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Wrap a pool after verifying DB health and that migrations ran.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                IntakeError::Internal(format!(
                    "catalog failed Postgres health check: {e}"
                ))
            })?;
        info!(target: "catalog", "catalog connected to Postgres");

        let idx_exists = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE schemaname = current_schema()
              AND indexname = $1
            LIMIT 1
            "#,
        )
        .bind(FIFO_INDEX)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            IntakeError::Internal(format!("catalog schema validation failed: {e}"))
        })?
        .is_some();

        if !idx_exists {
            return Err(IntakeError::Internal(format!(
                "Required index {FIFO_INDEX} is missing; run migrations"
            )));
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_case(
        tx: &mut Transaction<'_, Postgres>,
        case_id: &CaseId,
    ) -> Result<Option<Case>> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE case_id = $1"
        ))
        .bind(case_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Case::try_from).transpose()
    }

    async fn fetch_work_item_for_case(
        tx: &mut Transaction<'_, Postgres>,
        case_id: &CaseId,
    ) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE case_id = $1"
        ))
        .bind(case_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn transition_owned(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
        to: WorkItemState,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE work_items
            SET state = $3,
                owner_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'locked'
              AND owner_id = $2
            "#,
        )
        .bind(work_item_id.to_uuid())
        .bind(worker.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }
}

#[async_trait]
impl CatalogRepository for PostgresCatalog {
    async fn find_case_by_id(&self, case_id: &CaseId) -> Result<Option<Case>> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE case_id = $1"
        ))
        .bind(case_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Case::try_from).transpose()
    }

    async fn create_case_with_work_item(
        &self,
        case: NewCase,
    ) -> Result<CaseRegistration> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, CaseRow>(&format!(
            r#"
            INSERT INTO cases (
                case_id, subject_id, subject_label, acquisition_date,
                free_text_fields, root_path, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (case_id) DO NOTHING
            RETURNING {CASE_COLUMNS}
            "#
        ))
        .bind(case.case_id.as_str())
        .bind(case.subject_id.as_deref())
        .bind(case.subject_label.as_deref())
        .bind(case.acquisition_date)
        .bind(Json(&case.free_text_fields))
        .bind(path_text(&case.root_path))
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            let work_item = sqlx::query_as::<_, WorkItemRow>(&format!(
                r#"
                INSERT INTO work_items (id, case_id, state, created_at, updated_at)
                VALUES ($1, $2, 'queued', NOW(), NOW())
                RETURNING {WORK_ITEM_COLUMNS}
                "#
            ))
            .bind(WorkItemId::new().to_uuid())
            .bind(case.case_id.as_str())
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            info!(target: "catalog", case_id = %case.case_id, "registered new case");
            return Ok(CaseRegistration {
                case: Case::try_from(row)?,
                work_item: WorkItem::try_from(work_item)?,
                created: true,
            });
        }

        // Lost the race (or the case predates this call). The conflicting
        // insert has committed by now, so the winner's pair is visible.
        let existing = Self::fetch_case(&mut tx, &case.case_id).await?;
        let work_item =
            Self::fetch_work_item_for_case(&mut tx, &case.case_id).await?;
        tx.commit().await?;

        match (existing, work_item) {
            (Some(case), Some(work_item)) => {
                debug!(target: "catalog", case_id = %case.case_id, "case already registered");
                Ok(CaseRegistration {
                    case,
                    work_item,
                    created: false,
                })
            }
            _ => Err(IntakeError::Internal(format!(
                "case {} conflicted but could not be re-read",
                case.case_id
            ))),
        }
    }

    async fn find_item_by_sop_like_id(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE item_id = $1"
        ))
        .bind(item_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Item::try_from).transpose()
    }

    async fn create_item(&self, item: NewItem) -> Result<Item> {
        let frame_count = i32::try_from(item.frame_count.max(1)).unwrap_or(i32::MAX);
        let inserted = sqlx::query_as::<_, ItemRow>(&format!(
            r#"
            INSERT INTO items (
                item_id, case_id, ordinal_number, stored_path, frame_count,
                extracted_fields, render_cache_path, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NOW())
            ON CONFLICT (item_id) DO NOTHING
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(item.item_id.as_str())
        .bind(item.case_id.as_str())
        .bind(item.ordinal_number)
        .bind(path_text(&item.stored_path))
        .bind(frame_count)
        .bind(Json(&item.extracted_fields))
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            Ok(Some(row)) => Item::try_from(row),
            Ok(None) => Err(IntakeError::DuplicateItem(item.item_id)),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                Err(IntakeError::NotFound(format!("case {}", item.case_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let reclaimed = sqlx::query(
            r#"
            UPDATE work_items
            SET state = 'queued',
                owner_id = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE state = 'locked'
              AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reclaimed)
    }

    async fn acquire_next(
        &self,
        worker: &WorkerId,
        lease_duration: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let expires_at = lease_expiry(now, lease_duration)?;
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            r#"
            UPDATE work_items
            SET state = 'locked',
                owner_id = $1,
                lease_expires_at = $2,
                updated_at = $3
            WHERE id = (
                SELECT id
                FROM work_items
                WHERE state = 'queued'
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
              AND state = 'queued'
            RETURNING {WORK_ITEM_COLUMNS}
            "#
        ))
        .bind(worker.as_str())
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn complete(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        self.transition_owned(work_item_id, worker, WorkItemState::Completed)
            .await
    }

    async fn release(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        self.transition_owned(work_item_id, worker, WorkItemState::Queued)
            .await
    }

    async fn flag_for_review(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<bool> {
        self.transition_owned(work_item_id, worker, WorkItemState::NeedsReview)
            .await
    }

    async fn find_work_item(
        &self,
        work_item_id: WorkItemId,
    ) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(work_item_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn work_item_for_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE case_id = $1"
        ))
        .bind(case_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn items_for_case(&self, case_id: &CaseId) -> Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE case_id = $1 \
             ORDER BY ordinal_number, item_id"
        ))
        .bind(case_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Item::try_from).collect()
    }

    async fn set_render_cache_path(
        &self,
        item_id: &ItemId,
        path: &Path,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE items SET render_cache_path = $2 WHERE item_id = $1",
        )
        .bind(item_id.as_str())
        .bind(path_text(path))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(sqlx::FromRow)]
struct CaseRow {
    case_id: String,
    subject_id: Option<String>,
    subject_label: Option<String>,
    acquisition_date: Option<NaiveDate>,
    free_text_fields: Json<BTreeMap<String, String>>,
    root_path: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CaseRow> for Case {
    type Error = IntakeError;

    fn try_from(r: CaseRow) -> Result<Self> {
        Ok(Case {
            case_id: CaseId::new(r.case_id)?,
            subject_id: r.subject_id,
            subject_label: r.subject_label,
            acquisition_date: r.acquisition_date,
            free_text_fields: r.free_text_fields.0,
            root_path: PathBuf::from(r.root_path),
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    case_id: String,
    ordinal_number: i32,
    stored_path: String,
    frame_count: i32,
    extracted_fields: Json<ExtractedFields>,
    render_cache_path: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for Item {
    type Error = IntakeError;

    fn try_from(r: ItemRow) -> Result<Self> {
        Ok(Item {
            item_id: ItemId::new(r.item_id)?,
            case_id: CaseId::new(r.case_id)?,
            ordinal_number: r.ordinal_number,
            stored_path: PathBuf::from(r.stored_path),
            frame_count: u32::try_from(r.frame_count).unwrap_or(1).max(1),
            extracted_fields: r.extracted_fields.0,
            render_cache_path: r.render_cache_path.map(PathBuf::from),
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    case_id: String,
    state: String,
    owner_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = IntakeError;

    fn try_from(r: WorkItemRow) -> Result<Self> {
        Ok(WorkItem {
            work_item_id: WorkItemId(r.id),
            case_id: CaseId::new(r.case_id)?,
            state: r.state.parse::<WorkItemState>()?,
            lease: WorkItem::lease_from_parts(r.owner_id, r.lease_expires_at)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}
