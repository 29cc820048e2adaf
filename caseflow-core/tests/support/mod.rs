//! Shared fixtures and catalog scenarios for core integration tests.
//!
//! Every scenario takes a `dyn CatalogRepository` so the in-memory and the
//! Postgres catalogs are held to the same behaviour.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use caseflow_core::catalog::CatalogRepository;
use caseflow_core::error::{IntakeError, Result};
use caseflow_core::extract::{ExtractedRecord, MetadataExtractor};
use caseflow_core::ingest::{IngestOutcome, IngestionPipeline};
use caseflow_core::lease::{LeaseConfig, LeaseManager};
use caseflow_core::store::ContentStore;
use caseflow_model::{
    CaseId, ExtractedFields, ItemId, NewCase, NewItem, WorkItemState, WorkerId,
};
use chrono::{TimeDelta, Utc};
use tempfile::TempDir;

/// Reads `key=value` lines (`case`, `item`, optional `ordinal`) so scenarios
/// don't need real DICOM bytes.
#[derive(Debug, Default)]
pub struct LineExtractor;

impl MetadataExtractor for LineExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedRecord> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| IntakeError::MalformedInput("not utf-8".into()))?;
        let fields: BTreeMap<&str, &str> = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();

        let required = |key: &str| {
            fields
                .get(key)
                .copied()
                .filter(|value| !value.is_empty())
                .ok_or_else(|| IntakeError::MalformedInput(format!("missing {key}")))
        };
        let case_id = CaseId::new(required("case")?)
            .map_err(|err| IntakeError::MalformedInput(err.to_string()))?;
        let item_id = ItemId::new(required("item")?)
            .map_err(|err| IntakeError::MalformedInput(err.to_string()))?;

        Ok(ExtractedRecord {
            case_id,
            item_id,
            subject_id: None,
            subject_label: None,
            acquisition_date: None,
            instance_ordinal: fields
                .get("ordinal")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1),
            frame_count: 1,
            free_text_fields: BTreeMap::new(),
            extracted_fields: ExtractedFields::default(),
        })
    }
}

pub fn worker(name: &str) -> WorkerId {
    WorkerId::new(name).unwrap()
}

pub fn new_case(id: &str) -> NewCase {
    NewCase {
        case_id: CaseId::new(id).unwrap(),
        subject_id: Some("MRN-1".into()),
        subject_label: Some("DOE JANE".into()),
        acquisition_date: None,
        free_text_fields: BTreeMap::from([("modality".to_string(), "DX".to_string())]),
        root_path: PathBuf::from("/inbox"),
    }
}

pub fn new_item(case: &str, id: &str, ordinal: i32) -> NewItem {
    NewItem {
        item_id: ItemId::new(id).unwrap(),
        case_id: CaseId::new(case).unwrap(),
        ordinal_number: ordinal,
        stored_path: PathBuf::from(format!("/store/{case}/{id}.dcm")),
        frame_count: 1,
        extracted_fields: ExtractedFields::default(),
    }
}

/// Inbox and store under one temp dir, wired to `catalog`.
pub struct IntakeHarness {
    pub dir: TempDir,
    pub inbox: PathBuf,
    pub pipeline: IngestionPipeline,
}

impl IntakeHarness {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        let dir = TempDir::new().unwrap();
        let inbox = dir.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        let pipeline = IngestionPipeline::new(
            Arc::new(LineExtractor),
            ContentStore::new(dir.path().join("store")),
            catalog,
        );
        Self {
            dir,
            inbox,
            pipeline,
        }
    }

    pub fn drop_file(&self, name: &str, case: &str, item: &str) -> PathBuf {
        let path = self.inbox.join(name);
        std::fs::write(&path, format!("case={case}\nitem={item}\n")).unwrap();
        path
    }

    pub async fn ingest(&self, path: &Path) -> IngestOutcome {
        self.pipeline.process(path).await
    }
}

pub fn leases(catalog: Arc<dyn CatalogRepository>, secs: i64) -> LeaseManager {
    LeaseManager::new(
        catalog,
        LeaseConfig {
            lease_duration_secs: secs,
        },
    )
}

pub async fn concurrent_case_creation_yields_one_work_item(catalog: Arc<dyn CatalogRepository>) {
    let mut handles = Vec::new();
    for _ in 0..16 {
        let catalog = Arc::clone(&catalog);
        handles.push(tokio::spawn(async move {
            catalog.create_case_with_work_item(new_case("C1")).await
        }));
    }

    let mut created = 0;
    let mut work_items = HashSet::new();
    for handle in handles {
        let registration = handle.await.unwrap().unwrap();
        if registration.created {
            created += 1;
        }
        assert_eq!(registration.case.case_id.as_str(), "C1");
        work_items.insert(registration.work_item.work_item_id);
    }
    assert_eq!(created, 1);
    assert_eq!(work_items.len(), 1);

    let stored = catalog
        .work_item_for_case(&CaseId::new("C1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(work_items.contains(&stored.work_item_id));
    assert_eq!(stored.state, WorkItemState::Queued);
}

pub async fn duplicate_item_is_reported(catalog: Arc<dyn CatalogRepository>) {
    catalog.create_case_with_work_item(new_case("C1")).await.unwrap();
    catalog.create_item(new_item("C1", "I1", 1)).await.unwrap();

    let err = catalog.create_item(new_item("C1", "I1", 1)).await.unwrap_err();
    assert!(matches!(err, IntakeError::DuplicateItem(ref id) if id.as_str() == "I1"));

    let items = catalog
        .items_for_case(&CaseId::new("C1").unwrap())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
}

pub async fn items_require_their_case(catalog: Arc<dyn CatalogRepository>) {
    let err = catalog
        .create_item(new_item("missing", "I1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, IntakeError::NotFound(_)));
}

pub async fn items_are_listed_by_ordinal(catalog: Arc<dyn CatalogRepository>) {
    catalog.create_case_with_work_item(new_case("C1")).await.unwrap();
    for (id, ordinal) in [("I3", 3), ("I1", 1), ("I2", 2)] {
        catalog.create_item(new_item("C1", id, ordinal)).await.unwrap();
    }

    let ids: Vec<String> = catalog
        .items_for_case(&CaseId::new("C1").unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.item_id.as_str().to_string())
        .collect();
    assert_eq!(ids, ["I1", "I2", "I3"]);

    let thumb = Path::new("/cache/C1/I2_thumb.jpg");
    let item_id = ItemId::new("I2").unwrap();
    assert!(catalog.set_render_cache_path(&item_id, thumb).await.unwrap());
    let item = catalog.find_item_by_sop_like_id(&item_id).await.unwrap().unwrap();
    assert_eq!(item.render_cache_path.as_deref(), Some(thumb));
    assert!(
        !catalog
            .set_render_cache_path(&ItemId::new("nope").unwrap(), thumb)
            .await
            .unwrap()
    );
}

pub async fn acquire_is_oldest_first(catalog: Arc<dyn CatalogRepository>) {
    for case in ["C1", "C2", "C3"] {
        catalog.create_case_with_work_item(new_case(case)).await.unwrap();
    }
    let now = Utc::now();
    let mut order = Vec::new();
    while let Some(work) = catalog
        .acquire_next(&worker("x"), TimeDelta::minutes(30), now)
        .await
        .unwrap()
    {
        order.push(work.case_id.as_str().to_string());
    }
    assert_eq!(order, ["C1", "C2", "C3"]);
}

pub async fn acquire_is_exclusive(catalog: Arc<dyn CatalogRepository>) {
    for case in ["C1", "C2", "C3"] {
        catalog.create_case_with_work_item(new_case(case)).await.unwrap();
    }

    let now = Utc::now();
    let mut handles = Vec::new();
    for n in 0..8 {
        let catalog = Arc::clone(&catalog);
        handles.push(tokio::spawn(async move {
            catalog
                .acquire_next(&worker(&format!("w{n}")), TimeDelta::minutes(30), now)
                .await
        }));
    }

    let mut acquired = HashSet::new();
    for handle in handles {
        if let Some(work) = handle.await.unwrap().unwrap() {
            assert_eq!(work.state, WorkItemState::Locked);
            assert!(acquired.insert(work.work_item_id), "work item handed out twice");
        }
    }
    assert_eq!(acquired.len(), 3);
}

pub async fn reclaim_requeues_only_expired_leases(catalog: Arc<dyn CatalogRepository>) {
    for case in ["C1", "C2"] {
        catalog.create_case_with_work_item(new_case(case)).await.unwrap();
    }
    let t0 = Utc::now();
    let short = catalog
        .acquire_next(&worker("x"), TimeDelta::seconds(1), t0)
        .await
        .unwrap()
        .unwrap();
    let long = catalog
        .acquire_next(&worker("y"), TimeDelta::minutes(30), t0)
        .await
        .unwrap()
        .unwrap();

    let reclaimed = catalog
        .reclaim_expired_leases(t0 + TimeDelta::seconds(2))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let short = catalog.find_work_item(short.work_item_id).await.unwrap().unwrap();
    assert_eq!(short.state, WorkItemState::Queued);
    assert!(short.owner_id().is_none());
    assert!(short.lease_expiry().is_none());

    let long = catalog.find_work_item(long.work_item_id).await.unwrap().unwrap();
    assert_eq!(long.state, WorkItemState::Locked);
    assert_eq!(long.owner_id(), Some(&worker("y")));
}

pub async fn foreign_owner_is_denied(catalog: Arc<dyn CatalogRepository>) {
    catalog.create_case_with_work_item(new_case("C1")).await.unwrap();
    let work = catalog
        .acquire_next(&worker("x"), TimeDelta::minutes(30), Utc::now())
        .await
        .unwrap()
        .unwrap();

    assert!(!catalog.complete(work.work_item_id, &worker("y")).await.unwrap());
    assert!(!catalog.release(work.work_item_id, &worker("y")).await.unwrap());
    assert!(!catalog.flag_for_review(work.work_item_id, &worker("y")).await.unwrap());

    let current = catalog.find_work_item(work.work_item_id).await.unwrap().unwrap();
    assert_eq!(current.state, WorkItemState::Locked);
    assert_eq!(current.owner_id(), Some(&worker("x")));
    assert_eq!(current.lease_expiry(), work.lease_expiry());

    assert!(catalog.release(work.work_item_id, &worker("x")).await.unwrap());
    let released = catalog.find_work_item(work.work_item_id).await.unwrap().unwrap();
    assert_eq!(released.state, WorkItemState::Queued);
    assert!(released.owner_id().is_none());
}

/// File A lands, X takes and completes it, Y never sees it.
pub async fn single_file_lifecycle(catalog: Arc<dyn CatalogRepository>) {
    let harness = IntakeHarness::new(Arc::clone(&catalog));
    let path = harness.drop_file("a.dcm", "C1", "I1");

    let outcome = harness.ingest(&path).await;
    assert!(
        matches!(outcome, IngestOutcome::Ingested { case_created: true, .. }),
        "unexpected outcome {outcome:?}"
    );
    let case = catalog
        .find_case_by_id(&CaseId::new("C1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(case.root_path, harness.inbox);
    let w1 = catalog.work_item_for_case(&case.case_id).await.unwrap().unwrap();
    assert_eq!(w1.state, WorkItemState::Queued);

    let leases = leases(Arc::clone(&catalog), 1800);
    let taken = leases.next(&worker("x")).await.unwrap();
    assert_eq!(taken.work_item_id, w1.work_item_id);
    assert_eq!(taken.state, WorkItemState::Locked);
    assert_eq!(taken.owner_id(), Some(&worker("x")));

    assert!(matches!(leases.next(&worker("y")).await, Err(IntakeError::QueueEmpty)));

    leases.complete(w1.work_item_id, &worker("x")).await.unwrap();
    let done = catalog.find_work_item(w1.work_item_id).await.unwrap().unwrap();
    assert_eq!(done.state, WorkItemState::Completed);
    assert!(done.lease.is_none());

    assert!(matches!(leases.next(&worker("y")).await, Err(IntakeError::QueueEmpty)));
}

/// The same file observed twice catalogs one item and one work item.
pub async fn duplicate_observation_is_idempotent(catalog: Arc<dyn CatalogRepository>) {
    let harness = IntakeHarness::new(Arc::clone(&catalog));
    let path = harness.drop_file("a.dcm", "C1", "I1");

    assert!(matches!(harness.ingest(&path).await, IngestOutcome::Ingested { .. }));
    assert!(matches!(harness.ingest(&path).await, IngestOutcome::Duplicate { .. }));

    let case_id = CaseId::new("C1").unwrap();
    assert_eq!(catalog.items_for_case(&case_id).await.unwrap().len(), 1);
    assert!(catalog.work_item_for_case(&case_id).await.unwrap().is_some());

    let leases = leases(Arc::clone(&catalog), 1800);
    leases.next(&worker("x")).await.unwrap();
    assert!(matches!(leases.next(&worker("y")).await, Err(IntakeError::QueueEmpty)));
}

/// X holds a one-second lease and walks away; Y picks the work up later.
pub async fn abandoned_lease_is_reassigned(catalog: Arc<dyn CatalogRepository>) {
    catalog.create_case_with_work_item(new_case("C1")).await.unwrap();
    let leases = leases(Arc::clone(&catalog), 1);

    let w1 = leases.next(&worker("x")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let reassigned = leases.next(&worker("y")).await.unwrap();
    assert_eq!(reassigned.work_item_id, w1.work_item_id);
    assert_eq!(reassigned.owner_id(), Some(&worker("y")));

    assert!(matches!(
        leases.complete(w1.work_item_id, &worker("x")).await,
        Err(IntakeError::NotFound(_))
    ));
}

/// A lease that would end past the representable calendar is refused and
/// the work stays available.
pub async fn oversized_lease_is_refused(catalog: Arc<dyn CatalogRepository>) {
    let registration = catalog.create_case_with_work_item(new_case("C1")).await.unwrap();

    let err = leases(Arc::clone(&catalog), 9_000_000_000_000)
        .next(&worker("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, IntakeError::Internal(_)));

    let leased = leases(Arc::clone(&catalog), 1800).next(&worker("y")).await.unwrap();
    assert_eq!(leased.work_item_id, registration.work_item.work_item_id);
}
