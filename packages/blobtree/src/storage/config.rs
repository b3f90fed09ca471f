// Storage configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable overriding the storage root
pub const STORE_ENV: &str = "BLOBTREE_STORE";

/// Which backend a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Filesystem under `root`
    #[default]
    Local,
    /// Process-local, discarded on drop
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the local backend
    pub root: PathBuf,

    #[serde(default)]
    pub backend: BackendKind,
}

impl StorageConfig {
    /// Load configuration with the following priority:
    /// 1. BLOBTREE_STORE environment variable
    /// 2. config.toml file
    /// 3. Default: ~/.cache/blobtree
    pub async fn load() -> Result<Self> {
        if let Ok(env_path) = std::env::var(STORE_ENV) {
            return Ok(Self {
                root: PathBuf::from(env_path),
                backend: BackendKind::Local,
            });
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::from_file(&config_path).await;
            }
        }

        Ok(Self::default())
    }

    /// Read a configuration file. `.json` files use the legacy JSON
    /// description, anything else is parsed as TOML.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        Ok(config)
    }

    /// Get the config file path (~/.config/blobtree/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("blobtree").join("config.toml"))
    }

    /// Save configuration to the default config file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()
            .context("Failed to determine config directory")?;
        self.save_to(&config_path).await
    }

    /// Save configuration as TOML at `path`
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Directory holding committed blobs
    pub fn store_path(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Directory holding in-flight streamed writes
    pub fn staging_path(&self) -> PathBuf {
        self.root.join("staging")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blobtree");

        Self {
            root,
            backend: BackendKind::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, BackendKind::Local);
        assert!(config.root.ends_with("blobtree"));
    }

    #[test]
    fn test_layout_paths() {
        let config = StorageConfig {
            root: PathBuf::from("/tmp/test-blobtree"),
            backend: BackendKind::Local,
        };

        assert_eq!(config.store_path(), PathBuf::from("/tmp/test-blobtree/store"));
        assert_eq!(config.staging_path(), PathBuf::from("/tmp/test-blobtree/staging"));
    }

    #[tokio::test]
    async fn test_from_toml_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "root = \"/srv/blobs\"\nbackend = \"memory\"\n")
            .await
            .unwrap();

        let config = StorageConfig::from_file(&path).await.unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/blobs"));
        assert_eq!(config.backend, BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_from_json_file_defaults_backend() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("storage.json");
        fs::write(&path, r#"{"root": "/srv/legacy"}"#).await.unwrap();

        let config = StorageConfig::from_file(&path).await.unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/legacy"));
        assert_eq!(config.backend, BackendKind::Local);
    }

    #[tokio::test]
    async fn test_from_file_rejects_unknown_backend() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "root = \"/x\"\nbackend = \"s3\"\n").await.unwrap();

        assert!(StorageConfig::from_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let config = StorageConfig {
            root: PathBuf::from("/data/blobtree"),
            backend: BackendKind::Local,
        };

        config.save_to(&path).await.unwrap();
        let loaded = StorageConfig::from_file(&path).await.unwrap();
        assert_eq!(loaded.root, config.root);
        assert_eq!(loaded.backend, config.backend);
    }

    #[tokio::test]
    async fn test_load_from_env() {
        std::env::set_var(STORE_ENV, "/tmp/env-test");

        let config = StorageConfig::load().await.unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/env-test"));

        std::env::remove_var(STORE_ENV);
    }
}
