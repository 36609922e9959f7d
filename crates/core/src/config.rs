use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "ENSCALE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub defaults: DefaultsConfig,
    /// Extra tracing filter applied when no CLI filter is given.
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub tile_overlap: u32,
    pub encode_quality: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            defaults: DefaultsConfig::default(),
            log_filter: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            tile_overlap: 16,
            encode_quality: 90,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. ENSCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }
    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }
    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// First-run setup: create the data directory and write a default
/// config.toml when one does not exist yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }
    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }
    Ok(())
}

/// Returns `path` as-is when absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.defaults.tile_overlap, 16);
        assert_eq!(cfg.defaults.encode_quality, 90);
        assert!(cfg.log_filter.is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let original = AppConfig {
            log_filter: Some("debug".into()),
            ..Default::default()
        };
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let decoded: AppConfig = toml::from_str("[paths]\nmodels_dir = \"/opt/models\"\n").unwrap();
        assert_eq!(decoded.paths.models_dir, PathBuf::from("/opt/models"));
        assert_eq!(decoded.defaults.tile_overlap, 16);
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn test_initialize_preserves_existing_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = config_path(dir.path());
        fs::write(&cfg_path, "log_filter = \"trace\"\n").unwrap();

        initialize_data_dir(dir.path()).unwrap();
        let content = fs::read_to_string(&cfg_path).unwrap();
        assert_eq!(content, "log_filter = \"trace\"\n");
    }

    #[test]
    fn test_data_dir_cli_override_wins() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));
    }

    #[test]
    fn test_resolve_relative_to() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs")),
            PathBuf::from("/abs")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
