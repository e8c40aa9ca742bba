//! Configuration loading and data directory resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "vpa_an=debug,info")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Object storage collaborator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// HTTP endpoint of the object store (e.g. "http://127.0.0.1:9000")
    pub endpoint: Option<String>,
    /// Bucket that upload notifications are accepted for
    pub bucket: Option<String>,
}

/// Inference backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Token presented to inference backends on connect
    pub service_token: Option<String>,
    /// Sample every Nth frame of a video object
    pub frame_stride: Option<u32>,
    /// Upper bound on sampled frames per view
    pub max_frames: Option<u32>,
    /// Per-call deadline in milliseconds
    pub deadline_ms: Option<u64>,
    /// Base retry backoff delay in milliseconds
    pub retry_base_ms: Option<u64>,
    /// Retry backoff cap in milliseconds
    pub retry_max_delay_ms: Option<u64>,
    /// Maximum adapter attempts per view
    pub max_retries: Option<u32>,
    /// Model name -> "host:port" backend address
    #[serde(default)]
    pub models: BTreeMap<String, String>,
}

/// TOML configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// HTTP bind address (default 127.0.0.1:5841)
    pub bind_address: Option<String>,
    /// Data directory override (database location)
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Default configuration file path for a service
///
/// `~/.config/vpa/<service>.toml` on Linux/macOS, the platform config
/// directory elsewhere.
pub fn default_config_path(service: &str) -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("vpa").join(format!("{}.toml", service)))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
}

/// Load TOML configuration from a path
///
/// A missing file is not an error; defaults apply.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read config failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse config failed: {}", e)))
}

/// Write TOML configuration to a path, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write to a temp file then rename so readers never see a torn file
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Resolve the data directory (database location)
///
/// Priority order:
/// 1. `VPA_DATA_DIR` environment variable
/// 2. `data_dir` in the TOML config
/// 3. OS-dependent default (`~/.local/share/vpa` on Linux)
pub fn resolve_data_dir(config: &TomlConfig) -> PathBuf {
    if let Ok(dir) = std::env::var("VPA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(dir) = &config.data_dir {
        return dir.clone();
    }

    dirs::data_local_dir()
        .map(|d| d.join("vpa"))
        .unwrap_or_else(|| PathBuf::from("./vpa_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_toml_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.bind_address.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.inference.models.is_empty());
    }

    #[test]
    fn config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpa-an.toml");

        let mut config = TomlConfig::default();
        config.bind_address = Some("0.0.0.0:5841".to_string());
        config.storage.bucket = Some("videos".to_string());
        config
            .inference
            .models
            .insert("cx".to_string(), "10.3.250.181:8895".to_string());

        write_toml_config(&config, &path).unwrap();
        let loaded = load_toml_config(&path).unwrap();

        assert_eq!(loaded.bind_address.as_deref(), Some("0.0.0.0:5841"));
        assert_eq!(loaded.storage.bucket.as_deref(), Some("videos"));
        assert_eq!(
            loaded.inference.models.get("cx").map(String::as_str),
            Some("10.3.250.181:8895")
        );
    }

    #[test]
    fn partial_config_parses_with_section_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "bind_address = \"127.0.0.1:6000\"\n").unwrap();

        let config = load_toml_config(&path).unwrap();
        assert_eq!(config.bind_address.as_deref(), Some("127.0.0.1:6000"));
        assert_eq!(config.logging.level, "info");
        assert!(config.storage.endpoint.is_none());
    }
}
