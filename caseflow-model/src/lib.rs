//! Core data model definitions shared across caseflow crates.
#![allow(missing_docs)]

pub mod catalog;
pub mod error;
pub mod ids;
pub mod work;

pub use catalog::{Case, ExtractedFields, Item, NewCase, NewItem};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{CaseId, ItemId, WorkItemId, WorkerId};
pub use work::{Lease, WorkItem, WorkItemState};
