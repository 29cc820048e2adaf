//! Durable, content-addressed placement of ingested files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use caseflow_model::{CaseId, ItemId};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{IntakeError, Result};

pub const STORED_EXTENSION: &str = "dcm";

/// What `persist` did to the canonical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStatus {
    Written,
    /// Identical bytes were already present.
    Unchanged,
    /// Different bytes were present under the same identity and have been
    /// overwritten.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedFile {
    pub path: PathBuf,
    pub status: PersistStatus,
}

/// Files are stored at `<root>/<case_id>/<item_id>.dcm`. Writes are atomic
/// (temp file + rename), so the canonical path never holds a partial file.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, case_id: &CaseId, item_id: &ItemId) -> PathBuf {
        self.root.join(encode_component(case_id.as_str())).join(format!(
            "{}.{STORED_EXTENSION}",
            encode_component(item_id.as_str())
        ))
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            IntakeError::StorageUnavailable(format!(
                "failed to create store root {:?}: {err}",
                self.root
            ))
        })
    }

    /// Place `bytes` at the canonical location for `(case_id, item_id)` and
    /// return that location.
    pub async fn persist(
        &self,
        bytes: &[u8],
        case_id: &CaseId,
        item_id: &ItemId,
    ) -> Result<PathBuf> {
        self.place(bytes, case_id, item_id).await.map(|file| file.path)
    }

    /// Like [`ContentStore::persist`], reporting what happened on disk.
    pub async fn place(
        &self,
        bytes: &[u8],
        case_id: &CaseId,
        item_id: &ItemId,
    ) -> Result<PersistedFile> {
        let path = self.path_for(case_id, item_id);

        let existing = match tokio::fs::read(&path).await {
            Ok(existing) => Some(existing),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(IntakeError::StorageUnavailable(format!(
                    "failed to read stored file {:?}: {err}",
                    path
                )));
            }
        };

        let status = match existing {
            Some(existing) if digest(&existing) == digest(bytes) => {
                debug!(target: "ingest::store", path = %path.display(), "identical content already stored");
                return Ok(PersistedFile {
                    path,
                    status: PersistStatus::Unchanged,
                });
            }
            Some(_) => {
                warn!(
                    target: "ingest::store",
                    case_id = %case_id,
                    item_id = %item_id,
                    path = %path.display(),
                    "stored content differs for the same item identity; overwriting"
                );
                PersistStatus::Replaced
            }
            None => PersistStatus::Written,
        };

        self.write_atomic(&path, bytes).await?;
        Ok(PersistedFile { path, status })
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            IntakeError::StorageUnavailable(format!(
                "failed to create case dir {:?}: {err}",
                parent
            ))
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(
            ".{file_name}.tmp-{}",
            Uuid::new_v4().simple()
        ));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(|err| {
            IntakeError::StorageUnavailable(format!(
                "failed to create temp file {:?}: {err}",
                tmp
            ))
        })?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(IntakeError::StorageUnavailable(format!(
                "failed to write temp file {:?}: {err}",
                tmp
            )));
        }

        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(IntakeError::StorageUnavailable(format!(
                "failed to move {:?} -> {:?}: {err}",
                tmp, path
            )));
        }
        Ok(())
    }
}

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Identities come from file metadata. Bytes outside `[A-Za-z0-9._-]`, a
/// leading `.` and `%` itself are percent-encoded, so distinct identities
/// never share a path and none can leave the store root.
pub(crate) fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for (index, byte) in raw.bytes().enumerate() {
        let literal = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && index > 0);
        if literal {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}
