pub mod sources;

use std::path::{Path, PathBuf};

use caseflow_core::{IngestConfig, LeaseConfig, RenderConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub ingest: IngestConfig,
    pub lease: LeaseConfig,
    pub render: RenderConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        self.paths.ensure_directories()
    }

    pub fn inbox(&self) -> &Path {
        &self.paths.inbox
    }

    pub fn store_root(&self) -> &Path {
        &self.paths.store
    }

    pub fn render_cache_dir(&self) -> &Path {
        &self.paths.render_cache
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Absent in ephemeral deployments.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub inbox: PathBuf,
    pub store: PathBuf,
    pub render_cache: PathBuf,
}

impl PathsConfig {
    /// Create every configured directory that does not exist yet.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.inbox)?;
        std::fs::create_dir_all(&self.store)?;
        std::fs::create_dir_all(&self.render_cache)?;
        Ok(())
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("./data");
        Self {
            inbox: data.join("inbox"),
            store: data.join("store"),
            render_cache: data.join("render-cache"),
        }
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
    pub inline_json: bool,
}
