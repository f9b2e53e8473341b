//! Persistence of the declared configuration document

use crate::config::APP_DIR_NAME;
use crate::declared::DeclaredConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "proxy-config.json";

/// Load/save access to the declared configuration.
///
/// `save` validates before writing and replaces the document atomically.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<DeclaredConfig>;
    fn save(&self, config: &DeclaredConfig) -> Result<()>;
    /// Human-readable location, for display
    fn location(&self) -> String;
}

pub type DynConfigStore = Arc<dyn ConfigStore>;

/// `<data_dir>/proxy-manager/proxy-config.json`
pub fn default_config_file() -> Result<PathBuf> {
    let dir = dirs_next::data_dir().ok_or_else(|| Error::Io {
        path: PathBuf::from("~"),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine the user data directory",
        ),
    })?;
    Ok(dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<DeclaredConfig> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Config file missing, using defaults");
            return Ok(DeclaredConfig::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let mut config: DeclaredConfig = serde_json::from_str(&content).map_err(|e| Error::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        // tolerate documents written with empty strings
        if config.proxy_name.is_empty() {
            config.proxy_name = DeclaredConfig::default().proxy_name;
        }
        if config.network.is_empty() {
            config.network = DeclaredConfig::default().network;
        }
        Ok(config)
    }

    fn save(&self, config: &DeclaredConfig) -> Result<()> {
        config.validate()?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let json = serde_json::to_string_pretty(config).map_err(|e| Error::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        file.write_all(json.as_bytes()).map_err(|e| self.io_error(e))?;
        file.write_all(b"\n").map_err(|e| self.io_error(e))?;
        file.as_file().sync_all().map_err(|e| self.io_error(e))?;
        file.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        debug!(path = %self.path.display(), "Config saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory document, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<DeclaredConfig>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(config: DeclaredConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn snapshot(&self) -> DeclaredConfig {
        self.config.lock().clone()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<DeclaredConfig> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &DeclaredConfig) -> Result<()> {
        config.validate()?;
        *self.config.lock() = config.clone();
        *self.saves.lock() += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declared::{ContainerEntry, RouteEntry};
    use tempfile::tempdir;

    fn sample() -> DeclaredConfig {
        DeclaredConfig {
            containers: vec![ContainerEntry::new("app")
                .with_label("Foo")
                .with_port(8080)
                .with_network("app-net")],
            routes: vec![RouteEntry {
                host_port: 8001,
                target: "app".to_string(),
            }],
            proxy_name: "proxy".to_string(),
            network: "proxy-net".to_string(),
        }
    }

    #[test]
    fn test_load_returns_default_when_missing() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("missing.json"));
        assert_eq!(store.load().unwrap(), DeclaredConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join(CONFIG_FILE_NAME));

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn test_save_rejects_invalid_document_without_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let store = JsonFileStore::new(&path);

        let mut config = sample();
        config.routes.push(RouteEntry {
            host_port: 8001,
            target: "app".to_string(),
        });

        let err = store.save(&config).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_reports_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_load_fills_empty_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"containers": [], "routes": [], "proxy_name": "", "network": ""}"#).unwrap();

        let config = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(config.proxy_name, "proxy-manager");
        assert_eq!(config.network, "proxy-net");
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryStore::new(sample());
        store.save(&DeclaredConfig::default()).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot(), DeclaredConfig::default());
    }
}
