use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::ids::{CaseId, ItemId};

/// One imaging study. Created once per distinct [`CaseId`] and read-mostly
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Case {
    pub case_id: CaseId,
    pub subject_id: Option<String>,
    pub subject_label: Option<String>,
    pub acquisition_date: Option<NaiveDate>,
    pub free_text_fields: BTreeMap<String, String>,
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a [`Case`]; timestamps are assigned by the catalog.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewCase {
    pub case_id: CaseId,
    pub subject_id: Option<String>,
    pub subject_label: Option<String>,
    pub acquisition_date: Option<NaiveDate>,
    pub free_text_fields: BTreeMap<String, String>,
    pub root_path: PathBuf,
}

impl NewCase {
    pub fn into_case(self, created_at: DateTime<Utc>) -> Case {
        Case {
            case_id: self.case_id,
            subject_id: self.subject_id,
            subject_label: self.subject_label,
            acquisition_date: self.acquisition_date,
            free_text_fields: self.free_text_fields,
            root_path: self.root_path,
            created_at,
        }
    }
}

/// Best-effort attributes parsed from an item's metadata. Every field is
/// optional; a parse failure simply leaves it unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExtractedFields {
    pub gestational_age_weeks: Option<u32>,
    pub birth_weight_grams: Option<u32>,
    pub acquisition_datetime: Option<String>,
    pub view_position: Option<String>,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        self == &ExtractedFields::default()
    }
}

/// One file/frame series inside a [`Case`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Item {
    pub item_id: ItemId,
    pub case_id: CaseId,
    pub ordinal_number: i32,
    /// Written only by the content store; always exists once committed.
    pub stored_path: PathBuf,
    pub frame_count: u32,
    pub extracted_fields: ExtractedFields,
    /// Written by the rendering collaborator, never by ingestion.
    pub render_cache_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewItem {
    pub item_id: ItemId,
    pub case_id: CaseId,
    pub ordinal_number: i32,
    pub stored_path: PathBuf,
    pub frame_count: u32,
    pub extracted_fields: ExtractedFields,
}

impl NewItem {
    pub fn into_item(self, created_at: DateTime<Utc>) -> Item {
        Item {
            item_id: self.item_id,
            case_id: self.case_id,
            ordinal_number: self.ordinal_number,
            stored_path: self.stored_path,
            frame_count: self.frame_count.max(1),
            extracted_fields: self.extracted_fields,
            render_cache_path: None,
            created_at,
        }
    }
}
