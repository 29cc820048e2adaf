//! Process wiring shared by the serve loop and the one-shot commands.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use caseflow_config::Config;
use caseflow_core::{
    CatalogRepository, ContentStore, InMemoryCatalog, IngestionPipeline,
    IngestionService, LeaseManager, MIGRATOR, MetadataExtractor, PostgresCatalog,
    RenderCollaborator, ThumbnailWriter,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};

use crate::infra::app_context::AppContext;

const MAX_CONNECTIONS: u32 = 10;

/// Catalog chosen at startup, plus the pool backing it when there is one.
#[derive(Debug)]
pub struct CatalogHandle {
    pub catalog: Arc<dyn CatalogRepository>,
    pub pool: Option<PgPool>,
}

impl CatalogHandle {
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

/// Postgres when a URL is configured, in-memory when `ephemeral` is set.
pub async fn open_catalog(
    config: &Config,
    ephemeral: bool,
) -> anyhow::Result<CatalogHandle> {
    if ephemeral {
        warn!("running with an in-memory catalog; nothing survives a restart");
        return Ok(CatalogHandle {
            catalog: Arc::new(InMemoryCatalog::new()),
            pool: None,
        });
    }

    let url = config.database.url.as_deref().ok_or_else(|| {
        anyhow!("no database URL configured; set DATABASE_URL or pass --ephemeral")
    })?;

    let pool = connect_pool(url).await?;
    run_migrations(&pool).await?;
    let catalog = PostgresCatalog::new(pool.clone())
        .await
        .context("catalog failed startup checks")?;

    Ok(CatalogHandle {
        catalog: Arc::new(catalog),
        pool: Some(pool),
    })
}

/// Wire the pipeline, ingestion service and lease manager. With a
/// `renderer`, each newly cataloged item also gets a thumbnail under
/// `paths.render_cache`, sized and encoded per `[render]`.
pub fn build_context(
    config: Arc<Config>,
    catalog: Arc<dyn CatalogRepository>,
    extractor: Arc<dyn MetadataExtractor>,
    renderer: Option<Arc<dyn RenderCollaborator>>,
) -> AppContext {
    let mut pipeline = IngestionPipeline::new(
        extractor,
        ContentStore::new(config.store_root()),
        Arc::clone(&catalog),
    );
    if let Some(renderer) = renderer {
        pipeline = pipeline.with_renderer(
            renderer,
            ThumbnailWriter::new(config.render_cache_dir(), config.render),
        );
    }
    let ingestion = Arc::new(IngestionService::new(
        config.inbox(),
        config.ingest.clone(),
        pipeline,
    ));
    let leases = Arc::new(LeaseManager::new(Arc::clone(&catalog), config.lease));

    AppContext::new(config, catalog, leases, ingestion)
}
