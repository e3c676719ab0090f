//! YAML load/save for any serde configuration type

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Read a YAML config, falling back to `T::default()`
///
/// A missing file is normal on first run. An unreadable or malformed file is
/// logged and also yields defaults, so a bad edit never keeps the engine from
/// starting.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("[CONFIG] {:?} not found, using defaults", path);
        return T::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("[CONFIG] cannot read {:?}: {}, using defaults", path, e);
            return T::default();
        }
    };

    match serde_yaml::from_str::<T>(&contents) {
        Ok(config) => {
            log::info!("[CONFIG] loaded {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("[CONFIG] cannot parse {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Write a config as YAML, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write {:?}", path))?;

    log::info!("[CONFIG] saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config: BackendConfig = load_config(Path::new("/nonexistent/tether/backend.yaml"));
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        std::fs::write(&path, "sample_rate: [not, a, number").unwrap();
        let config: BackendConfig = load_config(&path);
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn test_save_creates_directories_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("backend.yaml");
        let config = BackendConfig::default()
            .with_client_name("studio")
            .with_buffer_size(256);

        save_config(&config, &path).unwrap();
        let loaded: BackendConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        std::fs::write(&path, "sample_rate: 96000\n").unwrap();
        let config: BackendConfig = load_config(&path);
        assert_eq!(config.sample_rate, 96000);
        assert_eq!(config.buffer_size, BackendConfig::default().buffer_size);
    }
}
