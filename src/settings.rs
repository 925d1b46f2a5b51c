//! Optional TOML settings for the command-line front end.
//!
//! ```toml
//! catalog = "patterns.json"
//! backup_suffix = ".bpbak"
//! enabled = ["notifications", "ads_limits", "auto_update"]
//! install_dir = "C:/Users/me/AppData/Local/BraveSoftware/Brave-Browser/Application"
//! module_name = "chrome.dll"
//! ```
//!
//! Relative paths are resolved against the directory holding the settings file.

use crate::backup::DEFAULT_SUFFIX;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SETTINGS_FILE_NAME: &str = "brave-patcher.toml";
pub const HOME_SETTINGS_FILE_NAME: &str = ".brave-patcher.toml";
pub const DEFAULT_MODULE_NAME: &str = "chrome.dll";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings TOML ({path}): {source}")]
    Toml {
        path: PathBuf,
        source: toml_edit::de::Error,
    },

    #[error("invalid settings ({path}): {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default = "default_suffix")]
    pub backup_suffix: String,
    /// Rule ids to patch; `None` means the catalog's own defaults
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default = "default_module_name")]
    pub module_name: String,
}

fn default_suffix() -> String {
    DEFAULT_SUFFIX.to_string()
}

fn default_module_name() -> String {
    DEFAULT_MODULE_NAME.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog: None,
            backup_suffix: default_suffix(),
            enabled: None,
            install_dir: None,
            module_name: default_module_name(),
        }
    }
}

impl Settings {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings =
            toml_edit::de::from_str(&contents).map_err(|source| SettingsError::Toml {
                path: path.to_path_buf(),
                source,
            })?;

        if settings.backup_suffix.is_empty()
            || settings.backup_suffix.contains(['/', '\\'])
        {
            return Err(SettingsError::Invalid {
                path: path.to_path_buf(),
                message: format!(
                    "backup_suffix '{}' must be non-empty and contain no path separators",
                    settings.backup_suffix
                ),
            });
        }
        if settings.module_name.trim().is_empty() {
            return Err(SettingsError::Invalid {
                path: path.to_path_buf(),
                message: "module_name must not be empty".to_string(),
            });
        }

        if let Some(base) = path.parent() {
            settings.catalog = settings.catalog.map(|p| resolve(base, p));
            settings.install_dir = settings.install_dir.map(|p| resolve(base, p));
        }

        log::debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load settings using the lookup order: explicit path, `./brave-patcher.toml`,
    /// `~/.brave-patcher.toml`. Missing files yield defaults; an explicit path must exist.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        let candidates = std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(SETTINGS_FILE_NAME))
            .into_iter()
            .chain(home::home_dir().map(|home| home.join(HOME_SETTINGS_FILE_NAME)));

        for candidate in candidates {
            if candidate.is_file() {
                return Self::load_from_path(&candidate);
            }
        }

        Ok(Self::default())
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
