//! Run configuration.
//!
//! # Responsibility
//! - Deserialize `SyncConfig` from TOML.
//! - Resolve relative paths against the directory of the config file.
//!
//! # Example
//!
//! ```toml
//! database_path = "curation.sqlite3"
//! registry_snapshot = "registry.json"
//! archive_snapshot = "archive.json"
//!
//! [logging]
//! level = "info"
//!
//! [engine]
//! registry_database = "uniprotkb"
//! local_database = "intact"
//! ```

use crate::logging::default_log_level;
use crate::reconcile::EngineSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files; stderr when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// SQLite database holding the curated records.
    pub database_path: PathBuf,
    /// JSON snapshot of the authoritative registry.
    pub registry_snapshot: PathBuf,
    /// JSON snapshot of historical sequence versions.
    #[serde(default)]
    pub archive_snapshot: Option<PathBuf>,
    /// JSON-lines audit output; stdout when unset.
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl SyncConfig {
    /// Loads `path` and resolves relative paths against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Parses TOML without touching paths.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("database_path is empty".to_string()));
        }
        if self.registry_snapshot.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue(
                "registry_snapshot is empty".to_string(),
            ));
        }
        for (key, value) in [
            ("engine.registry_database", &self.engine.registry_database),
            ("engine.local_database", &self.engine.local_database),
            ("engine.caution_text", &self.engine.dead_caution_text),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue(format!("{key} is empty")));
            }
        }
        if self
            .engine
            .registry_database
            .eq_ignore_ascii_case(&self.engine.local_database)
        {
            return Err(ConfigError::InvalidValue(
                "engine.registry_database and engine.local_database must differ".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.database_path);
        resolve(&mut self.registry_snapshot);
        if let Some(path) = self.archive_snapshot.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.report_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.logging.dir.as_mut() {
            resolve(path);
        }
    }
}
