//! # Caseflow Core
//!
//! Imaging intake and work assignment for annotation workstations.
//!
//! ## Overview
//!
//! Files dropped into an inbox are identified, copied into a content store
//! and cataloged as Cases (one per study) and Items (one per image). Every new
//! Case gets exactly one WorkItem, which annotation workers lease, complete or
//! release.
//!
//! - [`extract`]: identity and best-effort fields from DICOM bytes
//! - [`store`]: deterministic, atomic placement of stored files
//! - [`catalog`]: the catalog repository trait, Postgres and in-memory
//! - [`ingest`]: the per-file pipeline and the long-lived ingestion service
//! - [`lease`]: worker-facing acquire/complete/release with lazy reclamation
//! - [`render`]: the seam for an external renderer and cached thumbnails
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use caseflow_core::{
//!     catalog::InMemoryCatalog,
//!     extract::DicomExtractor,
//!     ingest::IngestionPipeline,
//!     lease::{LeaseConfig, LeaseManager},
//!     store::ContentStore,
//! };
//! use caseflow_model::WorkerId;
//!
//! async fn ingest_and_lease() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     let pipeline = IngestionPipeline::new(
//!         Arc::new(DicomExtractor::new()),
//!         ContentStore::new("/srv/caseflow/store"),
//!         catalog.clone(),
//!     );
//!     pipeline.process("/srv/caseflow/inbox/IM0001.dcm".as_ref()).await;
//!
//!     let leases = LeaseManager::new(catalog, LeaseConfig::default());
//!     let work = leases.next(&WorkerId::new("reader-1")?).await?;
//!     println!("leased case {}", work.case_id);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Catalog repository trait and its Postgres and in-memory implementations
pub mod catalog;

/// Error taxonomy shared by every subsystem
pub mod error;

/// Metadata extraction from stored file bytes
pub mod extract;

/// Inbox observation, the ingestion pipeline and its service lifecycle
pub mod ingest;

/// Lease-based work assignment
pub mod lease;

/// Rendering collaborator seam and thumbnail cache
pub mod render;

/// Deterministic placement of stored files
pub mod store;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use catalog::{CaseRegistration, CatalogRepository, InMemoryCatalog, PostgresCatalog};
pub use error::{IntakeError, Result};
pub use extract::{DicomExtractor, ExtractedRecord, MetadataExtractor};
pub use ingest::{IngestConfig, IngestOutcome, IngestStage, IngestionPipeline, IngestionService};
pub use lease::{LeaseConfig, LeaseManager};
pub use render::{RenderCollaborator, RenderConfig, ThumbnailWriter};
pub use store::ContentStore;
