//! Standard locations for tether configuration

use std::path::PathBuf;

const APP_DIR: &str = "tether";
const CONFIG_FILE: &str = "backend.yaml";

/// `$XDG_CONFIG_HOME/tether` (or the platform equivalent)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// `<config_dir>/backend.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_layout() {
        let path = default_config_path();
        assert!(path.ends_with("tether/backend.yaml"));
    }
}
