//! StackFlow settings
//!
//! Locates the settings file, parses it and hands out the option types of
//! the core and rotation crates.

pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{
    ApplySettings, RetrySettings, RotationSettings, Settings, StackSettings, StateSettings,
};

use std::path::PathBuf;

/// Environment variable pointing directly at a settings file
pub const CONFIG_PATH_ENV: &str = "STACKFLOW_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["stackflow.local.yaml", "stackflow.yaml"];

/// Path of the global settings file (`~/.config/stackflow/stackflow.yaml`)
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stackflow").join("stackflow.yaml"))
}

/// Find the settings file
///
/// Search order:
/// 1. `STACKFLOW_CONFIG_PATH`
/// 2. working directory: stackflow.local.yaml, stackflow.yaml
/// 3. `./.stackflow/` with the same names
/// 4. `~/.config/stackflow/stackflow.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} points to a missing file", CONFIG_PATH_ENV);
    }

    let current_dir = std::env::current_dir()?;
    for dir in [current_dir.clone(), current_dir.join(".stackflow")] {
        if !dir.is_dir() {
            continue;
        }
        for filename in &CANDIDATES {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(global) = global_config_path()
        && global.exists()
    {
        return Ok(global);
    }

    Err(ConfigError::ConfigFileNotFound)
}
