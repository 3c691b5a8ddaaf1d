//! Standard configuration locations

use std::path::PathBuf;

/// Config file name inside [`default_config_dir`]
pub const CONFIG_FILE_NAME: &str = "bridge.yaml";

/// Returns: `<platform config dir>/mixbridge` (falls back to `./mixbridge`)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mixbridge")
}

/// Returns: `<platform config dir>/mixbridge/bridge.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}
