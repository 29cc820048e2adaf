use std::path::PathBuf;

use caseflow_core::{IngestConfig, LeaseConfig, RenderConfig};
use serde::{Deserialize, Serialize};

use crate::util::{non_empty_var, path_var};

/// Raw configuration as written in `caseflow.toml` (or JSON).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub paths: FilePathsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderConfig>,
}

impl FileConfig {
    /// Layer `other` on top of `self`; values present in `other` win.
    pub fn overlay(self, other: FileConfig) -> FileConfig {
        FileConfig {
            database: FileDatabaseConfig {
                url: other.database.url.or(self.database.url),
            },
            paths: FilePathsConfig {
                inbox: other.paths.inbox.or(self.paths.inbox),
                store: other.paths.store.or(self.paths.store),
                render_cache: other.paths.render_cache.or(self.paths.render_cache),
            },
            ingest: other.ingest.or(self.ingest),
            lease: other.lease.or(self.lease),
            render: other.render.or(self.render),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_cache: Option<PathBuf>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub database_url: Option<String>,
    pub inbox: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub render_cache: Option<PathBuf>,
    /// Humantime string, e.g. `30m`.
    pub lease_duration: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: path_var("CASEFLOW_CONFIG_PATH"),
            config_json: non_empty_var("CASEFLOW_CONFIG_JSON"),
            database_url: non_empty_var("DATABASE_URL"),
            inbox: path_var("CASEFLOW_INBOX"),
            store: path_var("CASEFLOW_STORE"),
            render_cache: path_var("CASEFLOW_RENDER_CACHE"),
            lease_duration: non_empty_var("CASEFLOW_LEASE_DURATION"),
        }
    }
}
