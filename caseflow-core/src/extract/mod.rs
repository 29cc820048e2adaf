//! Metadata extraction from imaging files.
//!
//! An extractor turns raw file bytes into the identities and descriptive
//! fields the catalog needs. Extraction is pure: it never touches the
//! filesystem or the database, so it can run on blocking worker threads.

pub mod dicom;
pub mod fields;

use std::collections::BTreeMap;
use std::path::Path;

use caseflow_model::{CaseId, ExtractedFields, ItemId, NewCase, NewItem};
use chrono::NaiveDate;

use crate::error::{IntakeError, Result};
use dicom::tags;

pub const FIELD_MODALITY: &str = "modality";
pub const FIELD_INSTITUTION: &str = "institution";
pub const FIELD_MANUFACTURER: &str = "manufacturer";
pub const FIELD_STUDY_DESCRIPTION: &str = "study_description";

/// Everything the catalog learns from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub case_id: CaseId,
    pub item_id: ItemId,
    pub subject_id: Option<String>,
    pub subject_label: Option<String>,
    pub acquisition_date: Option<NaiveDate>,
    pub instance_ordinal: i32,
    pub frame_count: u32,
    pub free_text_fields: BTreeMap<String, String>,
    pub extracted_fields: ExtractedFields,
}

impl ExtractedRecord {
    pub fn new_case(&self, root_path: &Path) -> NewCase {
        NewCase {
            case_id: self.case_id.clone(),
            subject_id: self.subject_id.clone(),
            subject_label: self.subject_label.clone(),
            acquisition_date: self.acquisition_date,
            free_text_fields: self.free_text_fields.clone(),
            root_path: root_path.to_path_buf(),
        }
    }

    pub fn new_item(&self, stored_path: &Path) -> NewItem {
        NewItem {
            item_id: self.item_id.clone(),
            case_id: self.case_id.clone(),
            ordinal_number: self.instance_ordinal,
            stored_path: stored_path.to_path_buf(),
            frame_count: self.frame_count,
            extracted_fields: self.extracted_fields.clone(),
        }
    }
}

/// Pluggable metadata reader. Implementations must be deterministic for
/// identical bytes.
pub trait MetadataExtractor: Send + Sync + std::fmt::Debug {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedRecord>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DicomExtractor;

impl DicomExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl MetadataExtractor for DicomExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedRecord> {
        let ds = dicom::parse(bytes)?;

        let case_id = ds
            .text(tags::STUDY_INSTANCE_UID)
            .ok_or_else(|| {
                IntakeError::MalformedInput("missing StudyInstanceUID".into())
            })
            .and_then(|raw| {
                CaseId::new(raw)
                    .map_err(|err| IntakeError::MalformedInput(err.to_string()))
            })?;
        let item_id = ds
            .text(tags::SOP_INSTANCE_UID)
            .ok_or_else(|| {
                IntakeError::MalformedInput("missing SOPInstanceUID".into())
            })
            .and_then(|raw| {
                ItemId::new(raw)
                    .map_err(|err| IntakeError::MalformedInput(err.to_string()))
            })?;

        let instance_ordinal = ds
            .text(tags::INSTANCE_NUMBER)
            .and_then(|raw| fields::parse_integer_string(&raw))
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(1);
        let frame_count = ds
            .text(tags::NUMBER_OF_FRAMES)
            .and_then(|raw| fields::parse_integer_string(&raw))
            .map(|n| n.clamp(1, i64::from(u32::MAX)) as u32)
            .unwrap_or(1);

        let mut free_text_fields = BTreeMap::new();
        for (key, tag) in [
            (FIELD_MODALITY, tags::MODALITY),
            (FIELD_INSTITUTION, tags::INSTITUTION_NAME),
            (FIELD_MANUFACTURER, tags::MANUFACTURER),
            (FIELD_STUDY_DESCRIPTION, tags::STUDY_DESCRIPTION),
        ] {
            if let Some(value) = ds.text(tag) {
                free_text_fields.insert(key.to_string(), value);
            }
        }

        let description = ds.text(tags::STUDY_DESCRIPTION).unwrap_or_default();
        let extracted_fields = ExtractedFields {
            gestational_age_weeks: fields::gestational_age_weeks(&description),
            birth_weight_grams: fields::birth_weight_grams(&description),
            acquisition_datetime: ds.text(tags::ACQUISITION_DATETIME),
            view_position: ds.text(tags::VIEW_POSITION),
        };

        Ok(ExtractedRecord {
            case_id,
            item_id,
            subject_id: ds.text(tags::PATIENT_ID),
            subject_label: ds
                .text(tags::PATIENT_NAME)
                .and_then(|raw| fields::display_person_name(&raw)),
            acquisition_date: ds
                .text(tags::STUDY_DATE)
                .and_then(|raw| fields::parse_study_date(&raw)),
            instance_ordinal,
            frame_count,
            free_text_fields,
            extracted_fields,
        })
    }
}
