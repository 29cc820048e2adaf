//! Configuration loading for caseflow.
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML or
//! JSON file (`$CASEFLOW_CONFIG_PATH` or `./caseflow.toml`), inline JSON in
//! `$CASEFLOW_CONFIG_JSON`, and individual environment variables. A `.env`
//! file is read first when present.
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{Config, ConfigMetadata, DatabaseConfig, PathsConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
