use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{Config, ConfigMetadata, DatabaseConfig, PathsConfig};
use crate::util::parse_duration;
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("caseflow.toml"),
        PathBuf::from("config/caseflow.toml"),
        PathBuf::from("caseflow.json"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` entirely.
    pub skip_env_file: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.options.skip_env_file = true;
        self
    }

    /// `.env`, then the config file, then `$CASEFLOW_CONFIG_JSON`, then
    /// individual environment overrides.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Same as [`ConfigLoader::load`] with an explicit environment snapshot.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;

        let inline = match env.config_json.as_deref() {
            Some(raw) => Some(
                serde_json::from_str::<FileConfig>(raw)
                    .map_err(|source| ConfigLoadError::InlineJson { source })?,
            ),
            None => None,
        };

        let mut warnings = ConfigWarnings::default();
        if file_config.is_none() && inline.is_none() {
            warnings.push_with_hint(
                "No caseflow.toml detected; using defaults and environment variables",
                "Set CASEFLOW_CONFIG_PATH or create ./caseflow.toml",
            );
        }

        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
            inline_json: inline.is_some(),
        };
        let layered = match inline {
            Some(inline) => file_config.unwrap_or_default().overlay(inline),
            None => file_config.unwrap_or_default(),
        };

        let config = compose_config(layered, env, metadata)?;
        warnings.extend(validation::apply_guard_rails(&config)?);

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(ConfigLoadError::EnvFile(err)),
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(path) = &self.options.config_path {
            (path.clone(), true)
        } else if let Some(path) = &env.config_path {
            (path.clone(), true)
        } else {
            match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path.clone(), false),
                None => return Ok((None, None)),
            }
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config = parse_file_config(&path, &contents)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn parse_file_config(path: &Path, contents: &str) -> Result<FileConfig, ConfigLoadError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(contents).map_err(|source| ConfigLoadError::ParseJson {
            path: path.to_path_buf(),
            source,
        }),
        _ => toml::from_str(contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        database: file_database,
        paths: file_paths,
        ingest,
        lease,
        render,
    } = file;

    let database = DatabaseConfig {
        url: env
            .database_url
            .or(file_database.url)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty()),
    };

    let defaults = PathsConfig::default();
    let paths = PathsConfig {
        inbox: env.inbox.or(file_paths.inbox).unwrap_or(defaults.inbox),
        store: env.store.or(file_paths.store).unwrap_or(defaults.store),
        render_cache: env
            .render_cache
            .or(file_paths.render_cache)
            .unwrap_or(defaults.render_cache),
    };

    let mut lease = lease.unwrap_or_default();
    if let Some(raw) = env.lease_duration {
        let duration = parse_duration(&raw).map_err(|source| ConfigLoadError::InvalidDuration {
            var: "CASEFLOW_LEASE_DURATION",
            value: raw.clone(),
            source,
        })?;
        lease.lease_duration_secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    }

    Ok(Config {
        database,
        paths,
        ingest: ingest.unwrap_or_default(),
        lease,
        render: render.unwrap_or_default(),
        metadata,
    })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse configuration {path}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse CASEFLOW_CONFIG_JSON")]
    InlineJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid duration '{value}' in {var}")]
    InvalidDuration {
        var: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
