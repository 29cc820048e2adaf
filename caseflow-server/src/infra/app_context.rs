use std::{fmt, path::Path, sync::Arc};

use caseflow_config::Config;
use caseflow_core::{
    CatalogRepository, IngestOutcome, IngestionService, LeaseManager, Result,
};
use caseflow_model::{Case, CaseId, Item, ItemId, WorkItem, WorkItemId, WorkerId};

/// Everything a transport needs to drive intake and hand out work.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    catalog: Arc<dyn CatalogRepository>,
    leases: Arc<LeaseManager>,
    ingestion: Arc<IngestionService>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("inbox", &self.config.inbox())
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn CatalogRepository>,
        leases: Arc<LeaseManager>,
        ingestion: Arc<IngestionService>,
    ) -> Self {
        Self {
            config,
            catalog,
            leases,
            ingestion,
        }
    }

    pub fn config(&self) -> &Config {
        self.config.as_ref()
    }

    pub fn catalog(&self) -> Arc<dyn CatalogRepository> {
        Arc::clone(&self.catalog)
    }

    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }

    pub fn ingestion(&self) -> Arc<IngestionService> {
        Arc::clone(&self.ingestion)
    }

    /// Manual trigger for a single inbox file.
    pub async fn ingest_now(&self, path: &Path) -> Result<IngestOutcome> {
        self.ingestion.ingest_now(path).await
    }

    pub async fn next_work_item(&self, worker: &WorkerId) -> Result<WorkItem> {
        self.leases.next(worker).await
    }

    pub async fn complete_work_item(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        self.leases.complete(work_item_id, worker).await
    }

    pub async fn release_work_item(
        &self,
        work_item_id: WorkItemId,
        worker: &WorkerId,
    ) -> Result<()> {
        self.leases.release(work_item_id, worker).await
    }

    pub async fn find_case(&self, case_id: &CaseId) -> Result<Option<Case>> {
        self.catalog.find_case_by_id(case_id).await
    }

    pub async fn find_item(&self, item_id: &ItemId) -> Result<Option<Item>> {
        self.catalog.find_item_by_sop_like_id(item_id).await
    }
}
