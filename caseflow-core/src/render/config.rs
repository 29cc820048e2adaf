use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Longest edge of generated thumbnails, in pixels.
    pub thumbnail_edge_px: u32,
    pub jpeg_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            thumbnail_edge_px: 256,
            jpeg_quality: 85,
        }
    }
}
