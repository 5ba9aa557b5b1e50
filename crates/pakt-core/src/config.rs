//! Backend configuration.
//!
//! Loaded from `pakt.toml` in the user's config directory. Every field has
//! a default, so a missing file or a partial file is fine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default paths for Arch Linux.
const DEFAULT_ROOT: &str = "/";
const DEFAULT_DBPATH: &str = "/var/lib/pacman";
const DEFAULT_PACMAN_CONF: &str = "/etc/pacman.conf";
const DEFAULT_WORKER: &str = "/usr/lib/pakt/pakt-worker";
const DEFAULT_ELEVATION: &str = "pkexec";

/// Where the package database lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Root directory for package installation.
    pub root: String,
    /// Database path.
    pub dbpath: String,
    /// pacman.conf, read for the repository list.
    pub pacman_conf: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            dbpath: DEFAULT_DBPATH.to_string(),
            pacman_conf: DEFAULT_PACMAN_CONF.to_string(),
        }
    }
}

/// Configuration for the backend and its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path of the worker executable.
    pub worker: PathBuf,
    /// Command the worker is launched through to gain privileges.
    /// An empty string runs the worker directly.
    pub elevation: Option<String>,
    /// Directory holding the persisted search index.
    pub index_dir: PathBuf,
    pub database: DatabaseConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            worker: PathBuf::from(DEFAULT_WORKER),
            elevation: Some(DEFAULT_ELEVATION.to_string()),
            index_dir: default_index_dir(),
            database: DatabaseConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pakt").join("pakt.toml"))
    }

    /// Loads the configuration from `path`, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads from the default location, or defaults if there is none.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.as_os_str().is_empty() {
            return Err(Error::ConfigError("worker path is empty".into()));
        }
        if self.index_dir.as_os_str().is_empty() {
            return Err(Error::ConfigError("index directory is empty".into()));
        }
        Ok(())
    }

    /// The elevation command, if the worker is launched through one.
    pub fn elevation_command(&self) -> Option<&str> {
        self.elevation
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }

    /// Path of the persisted search index file.
    pub fn index_path(&self) -> PathBuf {
        self.index_dir.join("index.json")
    }
}

fn default_index_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pakt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = BackendConfig::from_toml(
            r#"
            worker = "/opt/pakt/pakt-worker"

            [database]
            dbpath = "/tmp/pacman-db"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker, PathBuf::from("/opt/pakt/pakt-worker"));
        assert_eq!(config.elevation.as_deref(), Some("pkexec"));
        assert_eq!(config.database.dbpath, "/tmp/pacman-db");
        assert_eq!(config.database.root, "/");
    }

    #[test]
    fn test_empty_elevation_runs_directly() {
        let config = BackendConfig::from_toml(r#"elevation = " ""#).unwrap();
        assert_eq!(config.elevation_command(), None);
        assert_eq!(BackendConfig::default().elevation_command(), Some("pkexec"));
    }

    #[test]
    fn test_rejects_empty_worker() {
        let err = BackendConfig::from_toml(r#"worker = """#).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pakt.toml");
        std::fs::write(&path, "index_dir = \"/var/tmp/pakt\"\n").unwrap();

        let config = BackendConfig::load(&path).unwrap();
        assert_eq!(config.index_path(), PathBuf::from("/var/tmp/pakt/index.json"));
    }
}
