//! Config location – resolves and loads `~/.mnemo/config.toml`.
//!
//! The file format itself is [`mnemo_memory::MemoryConfig`]; this module only
//! decides *where* it lives and what the CLI falls back to without one.

use std::path::{Path, PathBuf};

use mnemo_memory::MemoryConfig;

/// Path of the config file: `$MNEMO_CONFIG` if set, else
/// `~/.mnemo/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("MNEMO_CONFIG") {
        return PathBuf::from(explicit);
    }
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mnemo").join("config.toml")
}

/// Default data directory used when no config file exists.
pub(crate) fn default_data_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mnemo").join("data")
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Load the config at `path`.  Without a file, the defaults are used with
/// both stores under `~/.mnemo/data`; `MNEMO_*` overrides apply either way.
///
/// Returns the config and whether it came from disk.
pub fn load(path: &Path) -> Result<(MemoryConfig, bool), String> {
    match MemoryConfig::load_from(path) {
        Ok(Some(cfg)) => Ok((cfg.validated(), true)),
        Ok(None) => {
            let mut cfg = MemoryConfig::with_data_dir(default_data_dir_for_home(&home_dir()));
            cfg.apply_env_overrides();
            Ok((cfg.validated(), false))
        }
        Err(e) => Err(format!("Failed to load config at {}: {}", path.display(), e)),
    }
}

/// Write the default configuration to `path` (data under `~/.mnemo/data`).
pub fn write_default(path: &Path) -> Result<(), String> {
    MemoryConfig::with_data_dir(default_data_dir_for_home(&home_dir()))
        .save_to(path)
        .map_err(|e| format!("Failed to save config: {e}"))
}
