//! Configuration parsing and management.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "blockbridge.yml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid document path `{0}`: must stay inside the vault")]
    InvalidDocumentPath(String),
}

/// Main configuration struct matching the blockbridge.yml schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub server: ServerConfig,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_vault")]
    pub vault: PathBuf,

    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            vault: default_vault(),
            database: default_database(),
        }
    }
}

fn default_vault() -> PathBuf {
    PathBuf::from("vault")
}

fn default_database() -> PathBuf {
    PathBuf::from(".blockbridge/sync.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    String::from("https://api.notion.com/v1")
}

fn default_api_version() -> String {
    String::from("2022-06-28")
}

fn default_timeout_secs() -> u64 {
    30
}

/// What happens to a queue entry that failed with a retriable error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Stay in `error` until someone requeues the entry
    #[default]
    Manual,
    /// Requeue automatically while attempts remain
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub mode: RetryMode,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            mode: RetryMode::Manual,
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    pub fn auto(max_attempts: u32) -> Self {
        Self {
            mode: RetryMode::Auto,
            max_attempts,
        }
    }

    /// Whether a retriable failure after `attempts` tries goes back to pending.
    pub fn should_requeue(&self, attempts: u32, retriable: bool) -> bool {
        retriable && self.mode == RetryMode::Auto && attempts < self.max_attempts
    }
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_keep_completed_days")]
    pub keep_completed_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            keep_completed_days: default_keep_completed_days(),
        }
    }
}

fn default_keep_completed_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    String::from("127.0.0.1:8767")
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;

        // Store config file path for relative path resolution
        config.config_path = Some(path.to_path_buf());

        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    ///
    /// Relative paths still resolve against the file's directory.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Self {
            config_path: Some(path.to_path_buf()),
            ..Self::default()
        })
    }

    /// Get the vault directory, resolved relative to config file
    pub fn vault_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.vault)
    }

    /// Get the database file, resolved relative to config file
    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    /// Map a vault-relative document path onto the filesystem.
    ///
    /// Absolute paths and `..` components are rejected.
    pub fn document_path(&self, local_path: &str) -> Result<PathBuf, ConfigError> {
        Ok(self.vault_dir().join(checked_relative(local_path)?))
    }

    /// Resolve a path relative to the config file location
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(parent) = self.config_path.as_ref().and_then(|p| p.parent()) {
            parent.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

/// Validate a vault-relative path, returning it normalized.
pub fn checked_relative(local_path: &str) -> Result<PathBuf, ConfigError> {
    let path = Path::new(local_path);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(ConfigError::InvalidDocumentPath(local_path.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ConfigError::InvalidDocumentPath(local_path.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
paths:
  vault: notes
  database: state/sync.db
remote:
  timeout_secs: 5
sync:
  retry:
    mode: auto
    max_attempts: 4
server:
  listen_addr: 0.0.0.0:9000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.paths.vault, PathBuf::from("notes"));
        assert_eq!(config.remote.timeout_secs, 5);
        assert_eq!(config.remote.api_version, "2022-06-28");
        assert_eq!(config.sync.retry, RetryPolicy::auto(4));
        assert_eq!(config.sync.keep_completed_days, 30);
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.sync.retry.mode, RetryMode::Manual);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8767");
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockbridge.yml");
        std::fs::write(&path, "paths:\n  vault: docs\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.vault_dir(), dir.path().join("docs"));
        assert_eq!(config.database_path(), dir.path().join(".blockbridge/sync.db"));

        let missing = Config::load_or_default(dir.path().join("nope.yml")).unwrap();
        assert_eq!(missing.vault_dir(), dir.path().join("vault"));
    }

    #[test]
    fn test_document_path_rejects_escapes() {
        let config = Config::default();
        assert!(config.document_path("../etc/passwd").is_err());
        assert!(config.document_path("/etc/passwd").is_err());
        assert!(config.document_path("").is_err());
        assert_eq!(
            config.document_path("./quests/cave.md").unwrap(),
            PathBuf::from("vault/quests/cave.md")
        );
    }

    #[test]
    fn test_retry_policy() {
        let manual = RetryPolicy::default();
        assert!(!manual.should_requeue(1, true));

        let auto = RetryPolicy::auto(3);
        assert!(auto.should_requeue(2, true));
        assert!(!auto.should_requeue(3, true));
        assert!(!auto.should_requeue(1, false));
    }
}
