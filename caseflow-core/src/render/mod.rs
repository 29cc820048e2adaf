//! Seam for the external rendering collaborator.
//!
//! The core never decodes pixel data itself. A [`RenderCollaborator`] turns a
//! stored file into a surface, and [`ThumbnailWriter`] caches a JPEG preview
//! of that surface whose path the catalog records.

mod config;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use caseflow_model::{CaseId, ItemId};
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use uuid::Uuid;

pub use config::RenderConfig;

use crate::error::{IntakeError, Result};
use crate::store::encode_component;

/// Decodes a stored file into pixels. Fails with `UnrenderableFile`.
pub trait RenderCollaborator: Send + Sync + std::fmt::Debug {
    fn render(&self, stored_path: &Path) -> Result<DynamicImage>;
}

#[derive(Debug, Clone)]
pub struct ThumbnailWriter {
    cache_root: PathBuf,
    config: RenderConfig,
}

impl ThumbnailWriter {
    pub fn new(cache_root: impl Into<PathBuf>, config: RenderConfig) -> Self {
        Self {
            cache_root: cache_root.into(),
            config,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn path_for(&self, case_id: &CaseId, item_id: &ItemId) -> PathBuf {
        self.cache_root
            .join(encode_component(case_id.as_str()))
            .join(format!("{}_thumb.jpg", encode_component(item_id.as_str())))
    }

    /// Fit the surface inside the configured edge and encode it as JPEG.
    pub fn encode(&self, surface: &DynamicImage) -> Result<Vec<u8>> {
        let edge = self.config.thumbnail_edge_px.max(1);
        if surface.width() == 0 || surface.height() == 0 {
            return Err(IntakeError::UnrenderableFile(
                "surface has no pixels".into(),
            ));
        }

        let fitted = if surface.width() > edge || surface.height() > edge {
            surface.resize(edge, edge, FilterType::Lanczos3)
        } else {
            surface.clone()
        };
        let rgb = fitted.to_rgb8();

        let mut out = Cursor::new(Vec::new());
        let quality = self.config.jpeg_quality.clamp(1, 100);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode_image(&rgb).map_err(|e| {
            IntakeError::UnrenderableFile(format!(
                "failed to encode thumbnail JPEG: {e}"
            ))
        })?;
        Ok(out.into_inner())
    }

    /// Encode and write the thumbnail, returning its cache path. Blocking.
    pub fn write(
        &self,
        case_id: &CaseId,
        item_id: &ItemId,
        surface: &DynamicImage,
    ) -> Result<PathBuf> {
        let bytes = self.encode(surface)?;
        let path = self.path_for(case_id, item_id);
        let parent = path.parent().unwrap_or(&self.cache_root);
        std::fs::create_dir_all(parent).map_err(|err| {
            IntakeError::StorageUnavailable(format!(
                "failed to create render cache dir {:?}: {err}",
                parent
            ))
        })?;

        let tmp = parent.join(format!(".thumb.tmp-{}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, &bytes)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|err| {
                let _ = std::fs::remove_file(&tmp);
                IntakeError::StorageUnavailable(format!(
                    "failed to write thumbnail {:?}: {err}",
                    path
                ))
            })?;
        Ok(path)
    }
}
