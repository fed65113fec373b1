//! Configuration Storage
//!
//! Handles reading/writing JSON files under the config directory.
//! Config location: ~/.connbridge on macOS/Linux, %APPDATA%\ConnBridge on Windows

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{AppConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the ConnBridge configuration directory
/// Returns %APPDATA%\ConnBridge on Windows, ~/.connbridge on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("ConnBridge"));
        }
        dirs::home_dir()
            .map(|home| home.join(".connbridge"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".connbridge"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the log directory for storing application logs
pub fn log_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("logs"))
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

pub fn hosts_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("hosts.json"))
}

/// Read a JSON file.
///
/// Returns `None` if the file doesn't exist. A file that fails to parse is
/// backed up beside the corrupt file and also yields `None`.
pub(crate) async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::Io(e)),
    };

    match serde_json::from_str::<T>(&contents) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("File {:?} corrupted: {}", path, e);
            match backup_file(path).await {
                Ok(backup_path) => {
                    tracing::warn!("Corrupted file backed up to {:?}, using defaults", backup_path);
                }
                Err(backup_err) => {
                    tracing::error!("Failed to backup corrupted file {:?}: {}", path, backup_err);
                }
            }
            Ok(None)
        }
    }
}

/// Write a JSON file atomically (temp file + rename)
pub(crate) async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Copy `path` to `<path>.backup.<timestamp>`
pub(crate) async fn backup_file(path: &Path) -> Result<PathBuf, StorageError> {
    let backup_path = path.with_extension(format!(
        "json.backup.{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ));

    if fs::metadata(path).await.is_ok() {
        fs::copy(path, &backup_path).await?;
    }

    Ok(backup_path)
}

/// `config.json` manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk.
    /// Missing or corrupted files give the default config.
    pub async fn load(&self) -> Result<AppConfig, StorageError> {
        let Some(config) = load_json::<AppConfig>(&self.path).await? else {
            return Ok(AppConfig::default());
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    pub async fn save(&self, config: &AppConfig) -> Result<(), StorageError> {
        save_json(&self.path, config).await
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(!storage.exists().await);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("config.json"));

        let mut config = AppConfig::default();
        config.directory.base_url = "http://127.0.0.1:9000/".to_string();
        config.probe.default_port = 2022;

        storage.save(&config).await.unwrap();
        assert!(storage.exists().await);

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_corrupted_config_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = ConfigStorage::with_path(path);
        let config = storage.load().await.unwrap();
        assert_eq!(config, AppConfig::default());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let result = ConfigStorage::with_path(path).load().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }
}
