use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used under the platform config and data directories
pub const APP_DIR_NAME: &str = "proxy-manager";

/// File name of the optional settings file
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Tool settings, loaded from an optional TOML file
///
/// Every field has a default, so an empty or missing file yields a working
/// configuration. The declared containers and routes live in a separate JSON
/// document (see [`crate::store`]).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Docker endpoint (`unix:///path` or `tcp://host:port`). Falls back to
    /// DOCKER_HOST and then the common socket locations.
    pub docker_host: Option<String>,

    /// Base image for the generated proxy image
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Upper bound for a single runtime call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Upper bound for an image build, in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Grace period given to a container on stop, in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// How many times a replacement proxy is checked before a reload gives up
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    /// Delay between readiness checks, in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Override for the declared configuration document location
    pub config_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_host: None,
            base_image: default_base_image(),
            call_timeout_secs: default_call_timeout(),
            build_timeout_secs: default_build_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval(),
            config_file: None,
        }
    }
}

fn default_base_image() -> String {
    "nginx:stable-alpine".to_string()
}

fn default_call_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    300 // base image pulls can be slow
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_readiness_attempts() -> u32 {
    5
}

fn default_readiness_interval() -> u64 {
    500
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` if given, otherwise from the default location if a
    /// file exists there, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_settings_file() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.base_image.trim().is_empty() {
            errors.push("'base_image' must not be empty".to_string());
        }
        if self.call_timeout_secs == 0 {
            errors.push("'call_timeout_secs' must be greater than 0".to_string());
        }
        if self.build_timeout_secs == 0 {
            errors.push("'build_timeout_secs' must be greater than 0".to_string());
        }
        if self.readiness_attempts == 0 {
            errors.push("'readiness_attempts' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::Validation(errors.join("; ")));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

/// `<config_dir>/proxy-manager/settings.toml`
pub fn default_settings_file() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.base_image, "nginx:stable-alpine");
        assert_eq!(settings.call_timeout(), Duration::from_secs(30));
        assert_eq!(settings.readiness_attempts, 5);
    }

    #[test]
    fn test_parse_settings() {
        let toml = r#"
docker_host = "unix:///run/user/1000/docker.sock"
base_image = "nginx:1.27-alpine"
call_timeout_secs = 5
readiness_attempts = 3
readiness_interval_ms = 250
config_file = "/tmp/routes.json"
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(
            settings.docker_host.as_deref(),
            Some("unix:///run/user/1000/docker.sock")
        );
        assert_eq!(settings.base_image, "nginx:1.27-alpine");
        assert_eq!(settings.call_timeout(), Duration::from_secs(5));
        assert_eq!(settings.build_timeout(), Duration::from_secs(300));
        assert_eq!(settings.readiness_interval(), Duration::from_millis(250));
        assert_eq!(settings.config_file, Some(PathBuf::from("/tmp/routes.json")));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let settings = Settings {
            call_timeout_secs: 0,
            readiness_attempts: 0,
            ..Settings::default()
        };

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("call_timeout_secs"));
        assert!(err.contains("readiness_attempts"));
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "call_timeout_secs = \"soon\"").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains(SETTINGS_FILE_NAME));
    }

    #[test]
    fn test_load_or_default_with_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "stop_timeout_secs = 2\n").unwrap();

        let settings = Settings::load_or_default(Some(&path)).unwrap();
        assert_eq!(settings.stop_timeout(), Duration::from_secs(2));
    }
}
