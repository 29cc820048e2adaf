use std::path::{Path, PathBuf};
use std::sync::Arc;

use caseflow_model::{CaseId, Item};
use tracing::{debug, info, warn};

use super::queue::Fingerprint;
use super::{IngestOutcome, IngestStage};
use crate::catalog::CatalogRepository;
use crate::error::IntakeError;
use crate::extract::{ExtractedRecord, MetadataExtractor};
use crate::render::{RenderCollaborator, ThumbnailWriter};
use crate::store::ContentStore;

#[derive(Debug, Clone)]
struct RenderStage {
    collaborator: Arc<dyn RenderCollaborator>,
    writer: ThumbnailWriter,
}

/// Observed -> Extracted -> Stored -> Cataloged -> Done for one file.
///
/// Storage always commits before the catalog, so a cataloged item never
/// points at a missing file. No step holds a catalog transaction open
/// while file I/O runs.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    extractor: Arc<dyn MetadataExtractor>,
    store: ContentStore,
    catalog: Arc<dyn CatalogRepository>,
    render: Option<RenderStage>,
}

impl IngestionPipeline {
    pub fn new(
        extractor: Arc<dyn MetadataExtractor>,
        store: ContentStore,
        catalog: Arc<dyn CatalogRepository>,
    ) -> Self {
        Self {
            extractor,
            store,
            catalog,
            render: None,
        }
    }

    /// Generate a cached thumbnail after each newly cataloged item.
    pub fn with_renderer(
        mut self,
        collaborator: Arc<dyn RenderCollaborator>,
        writer: ThumbnailWriter,
    ) -> Self {
        self.render = Some(RenderStage {
            collaborator,
            writer,
        });
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogRepository> {
        &self.catalog
    }

    pub async fn process(&self, path: &Path) -> IngestOutcome {
        self.process_observed(path).await.0
    }

    /// Run the pipeline, also returning the fingerprint the file had when it
    /// was read.
    pub(crate) async fn process_observed(
        &self,
        path: &Path,
    ) -> (IngestOutcome, Option<Fingerprint>) {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "ingest::pipeline", path = %path.display(), "observed file vanished");
                return (IngestOutcome::Vanished, None);
            }
            Err(err) => {
                return (retry(IngestStage::Observed, path, &IntakeError::Io(err)), None);
            }
        };
        if !metadata.is_file() {
            return (
                reject(IngestStage::Observed, path, "not a regular file".into()),
                None,
            );
        }
        let fingerprint = Some(Fingerprint::from_metadata(&metadata));

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "ingest::pipeline", path = %path.display(), "observed file vanished");
                return (IngestOutcome::Vanished, None);
            }
            Err(err) => {
                return (
                    retry(IngestStage::Observed, path, &IntakeError::Io(err)),
                    fingerprint,
                );
            }
        };

        (self.ingest_bytes(path, bytes).await, fingerprint)
    }

    async fn ingest_bytes(&self, path: &Path, bytes: Vec<u8>) -> IngestOutcome {
        let extractor = Arc::clone(&self.extractor);
        let extracted = tokio::task::spawn_blocking(move || {
            let record = extractor.extract(&bytes);
            (record, bytes)
        })
        .await;

        let (record, bytes) = match extracted {
            Ok((Ok(record), bytes)) => (record, bytes),
            Ok((Err(err), _)) => {
                return reject(IngestStage::Observed, path, err.to_string());
            }
            Err(join_err) => {
                return reject(
                    IngestStage::Observed,
                    path,
                    format!("metadata extraction panicked: {join_err}"),
                );
            }
        };

        let stored_path = match self
            .store
            .persist(&bytes, &record.case_id, &record.item_id)
            .await
        {
            Ok(stored_path) => stored_path,
            Err(err) => return failure(IngestStage::Extracted, path, err),
        };
        drop(bytes);

        match self.catalog_record(path, &record, &stored_path).await {
            Ok(CatalogStep::Duplicate) => {
                debug!(
                    target: "ingest::pipeline",
                    path = %path.display(),
                    item_id = %record.item_id,
                    "item already cataloged"
                );
                IngestOutcome::Duplicate {
                    item_id: record.item_id,
                }
            }
            Ok(CatalogStep::Created { item, case_created }) => {
                info!(
                    target: "ingest::pipeline",
                    path = %path.display(),
                    case_id = %item.case_id,
                    item_id = %item.item_id,
                    case_created,
                    "item ingested"
                );
                self.render_thumbnail(&item).await;
                IngestOutcome::Ingested {
                    case_id: item.case_id,
                    item_id: item.item_id,
                    stored_path,
                    case_created,
                }
            }
            Err(err) => failure(IngestStage::Stored, path, err),
        }
    }

    async fn catalog_record(
        &self,
        path: &Path,
        record: &ExtractedRecord,
        stored_path: &Path,
    ) -> crate::error::Result<CatalogStep> {
        if self
            .catalog
            .find_item_by_sop_like_id(&record.item_id)
            .await?
            .is_some()
        {
            return Ok(CatalogStep::Duplicate);
        }

        // The work item must exist before any item of its case is visible.
        let case_created = match self.catalog.find_case_by_id(&record.case_id).await? {
            Some(_) => false,
            None => {
                let root = path.parent().unwrap_or(path);
                self.catalog
                    .create_case_with_work_item(record.new_case(root))
                    .await?
                    .created
            }
        };

        match self.catalog.create_item(record.new_item(stored_path)).await {
            Ok(item) => Ok(CatalogStep::Created { item, case_created }),
            Err(IntakeError::DuplicateItem(_)) => Ok(CatalogStep::Duplicate),
            Err(err) => Err(err),
        }
    }

    async fn render_thumbnail(&self, item: &Item) {
        let Some(stage) = self.render.clone() else {
            return;
        };
        let case_id: CaseId = item.case_id.clone();
        let item_id = item.item_id.clone();
        let stored_path = item.stored_path.clone();

        let rendered = tokio::task::spawn_blocking(move || -> crate::error::Result<PathBuf> {
            let surface = stage.collaborator.render(&stored_path)?;
            stage.writer.write(&case_id, &item_id, &surface)
        })
        .await;

        let thumb = match rendered {
            Ok(Ok(thumb)) => thumb,
            Ok(Err(err)) => {
                warn!(
                    target: "ingest::pipeline",
                    item_id = %item.item_id,
                    error = %err,
                    "thumbnail generation failed"
                );
                return;
            }
            Err(join_err) => {
                warn!(
                    target: "ingest::pipeline",
                    item_id = %item.item_id,
                    error = %join_err,
                    "thumbnail generation panicked"
                );
                return;
            }
        };

        if let Err(err) = self
            .catalog
            .set_render_cache_path(&item.item_id, &thumb)
            .await
        {
            warn!(
                target: "ingest::pipeline",
                item_id = %item.item_id,
                error = %err,
                "failed to record thumbnail path"
            );
        }
    }
}

enum CatalogStep {
    Duplicate,
    Created { item: Item, case_created: bool },
}

fn failure(stage: IngestStage, path: &Path, err: IntakeError) -> IngestOutcome {
    if err.is_retryable() {
        retry(stage, path, &err)
    } else {
        reject(stage, path, err.to_string())
    }
}

fn retry(stage: IngestStage, path: &Path, err: &IntakeError) -> IngestOutcome {
    debug!(
        target: "ingest::pipeline",
        path = %path.display(),
        stage = %stage,
        error = %err,
        "transient failure"
    );
    IngestOutcome::Retry {
        stage,
        error: err.to_string(),
    }
}

fn reject(stage: IngestStage, path: &Path, reason: String) -> IngestOutcome {
    warn!(
        target: "ingest::pipeline",
        path = %path.display(),
        stage = %stage,
        reason = %reason,
        "file rejected"
    );
    IngestOutcome::Rejected { stage, reason }
}

#[cfg(test)]
mod tests {
    use caseflow_model::ItemId;
    use image::{DynamicImage, RgbImage};
    use tempfile::TempDir;

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::extract::DicomExtractor;
    use crate::extract::dicom::fixture::DicomFixture;
    use crate::render::RenderConfig;

    struct Harness {
        _dir: TempDir,
        inbox: PathBuf,
        store_root: PathBuf,
        catalog: InMemoryCatalog,
        pipeline: IngestionPipeline,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let inbox = dir.path().join("inbox");
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(&inbox).unwrap();
        let catalog = InMemoryCatalog::new();
        let pipeline = IngestionPipeline::new(
            Arc::new(DicomExtractor::new()),
            ContentStore::new(&store_root),
            Arc::new(catalog.clone()),
        );
        Harness {
            _dir: dir,
            inbox,
            store_root,
            catalog,
            pipeline,
        }
    }

    fn drop_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn new_file_creates_case_item_and_work_item() {
        let h = harness();
        let path = drop_file(
            &h.inbox,
            "a.dcm",
            &DicomFixture::new("C1", "I1").to_bytes(),
        );

        let outcome = h.pipeline.process(&path).await;
        let IngestOutcome::Ingested {
            case_id,
            item_id,
            stored_path,
            case_created,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(case_id.as_str(), "C1");
        assert_eq!(item_id.as_str(), "I1");
        assert!(case_created);
        assert_eq!(stored_path, h.store_root.join("C1").join("I1.dcm"));
        assert!(stored_path.exists());

        let case = h.catalog.find_case_by_id(&case_id).await.unwrap().unwrap();
        assert_eq!(case.root_path, h.inbox);
        assert_eq!(h.catalog.work_item_count(), 1);
    }

    #[tokio::test]
    async fn second_observation_is_a_duplicate() {
        let h = harness();
        let path = drop_file(
            &h.inbox,
            "a.dcm",
            &DicomFixture::new("C1", "I1").to_bytes(),
        );

        h.pipeline.process(&path).await;
        let again = h.pipeline.process(&path).await;
        assert!(matches!(again, IngestOutcome::Duplicate { .. }));
        assert_eq!(h.catalog.item_count(), 1);
        assert_eq!(h.catalog.work_item_count(), 1);
    }

    #[tokio::test]
    async fn items_of_one_case_share_a_work_item() {
        let h = harness();
        for (name, sop) in [("a.dcm", "I1"), ("b.dcm", "I2")] {
            let path = drop_file(
                &h.inbox,
                name,
                &DicomFixture::new("C1", sop).to_bytes(),
            );
            h.pipeline.process(&path).await;
        }
        assert_eq!(h.catalog.case_count(), 1);
        assert_eq!(h.catalog.item_count(), 2);
        assert_eq!(h.catalog.work_item_count(), 1);
    }

    #[tokio::test]
    async fn lookalike_item_ids_keep_their_own_bytes() {
        let h = harness();
        let caret_bytes = DicomFixture::new("C1", "I^1").to_bytes();
        let underscore_bytes = DicomFixture::new("C1", "I_1").to_bytes();
        let caret = drop_file(&h.inbox, "a.dcm", &caret_bytes);
        let underscore = drop_file(&h.inbox, "b.dcm", &underscore_bytes);

        h.pipeline.process(&caret).await;
        h.pipeline.process(&underscore).await;

        for (id, bytes) in [("I^1", &caret_bytes), ("I_1", &underscore_bytes)] {
            let item = h
                .catalog
                .find_item_by_sop_like_id(&ItemId::new(id).unwrap())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&std::fs::read(&item.stored_path).unwrap(), bytes);
        }
    }

    #[tokio::test]
    async fn malformed_file_is_rejected_without_side_effects() {
        let h = harness();
        let path = drop_file(&h.inbox, "bad.dcm", b"definitely not dicom");

        let outcome = h.pipeline.process(&path).await;
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected {
                stage: IngestStage::Observed,
                ..
            }
        ));
        assert_eq!(h.catalog.case_count(), 0);
        assert!(!h.store_root.exists());
    }

    #[tokio::test]
    async fn missing_file_vanishes() {
        let h = harness();
        let outcome = h.pipeline.process(&h.inbox.join("gone.dcm")).await;
        assert_eq!(outcome, IngestOutcome::Vanished);
    }

    #[tokio::test]
    async fn unwritable_store_is_retried_not_rejected() {
        let h = harness();
        std::fs::write(&h.store_root, b"blocker").unwrap();
        let path = drop_file(
            &h.inbox,
            "a.dcm",
            &DicomFixture::new("C1", "I1").to_bytes(),
        );

        let outcome = h.pipeline.process(&path).await;
        assert!(matches!(
            outcome,
            IngestOutcome::Retry {
                stage: IngestStage::Extracted,
                ..
            }
        ));
        assert_eq!(h.catalog.case_count(), 0);
    }

    #[derive(Debug)]
    struct SolidRenderer;

    impl RenderCollaborator for SolidRenderer {
        fn render(&self, _stored_path: &Path) -> crate::error::Result<DynamicImage> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(64, 32)))
        }
    }

    #[derive(Debug)]
    struct BrokenRenderer;

    impl RenderCollaborator for BrokenRenderer {
        fn render(&self, stored_path: &Path) -> crate::error::Result<DynamicImage> {
            Err(IntakeError::UnrenderableFile(stored_path.display().to_string()))
        }
    }

    #[tokio::test]
    async fn thumbnails_are_recorded_when_a_renderer_is_attached() {
        let h = harness();
        let cache = h.store_root.with_file_name("cache");
        let pipeline = h.pipeline.clone().with_renderer(
            Arc::new(SolidRenderer),
            ThumbnailWriter::new(&cache, RenderConfig::default()),
        );
        let path = drop_file(
            &h.inbox,
            "a.dcm",
            &DicomFixture::new("C1", "I1").to_bytes(),
        );

        assert!(matches!(
            pipeline.process(&path).await,
            IngestOutcome::Ingested { .. }
        ));
        let item = h
            .catalog
            .find_item_by_sop_like_id(&caseflow_model::ItemId::new("I1").unwrap())
            .await
            .unwrap()
            .unwrap();
        let thumb = item.render_cache_path.unwrap();
        assert_eq!(thumb, cache.join("C1").join("I1_thumb.jpg"));
        assert!(thumb.exists());
    }

    #[tokio::test]
    async fn render_failure_does_not_change_the_outcome() {
        let h = harness();
        let pipeline = h.pipeline.clone().with_renderer(
            Arc::new(BrokenRenderer),
            ThumbnailWriter::new(h.store_root.with_file_name("cache"), RenderConfig::default()),
        );
        let path = drop_file(
            &h.inbox,
            "a.dcm",
            &DicomFixture::new("C1", "I1").to_bytes(),
        );

        assert!(matches!(
            pipeline.process(&path).await,
            IngestOutcome::Ingested { .. }
        ));
    }
}
