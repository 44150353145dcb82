//! Settings loaded from `~/.config/pageocr/config.toml`.
//!
//! The pipeline reads settings through a [`watch`] channel so a language
//! change applies to the next OCR call without restarting the session, and
//! an `enabled` flip from off to on can trigger a fresh session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::page::Dimensions;

/// Local OCR/translation server.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5000";

/// Language the OCR server translates into when none is configured.
pub const DEFAULT_TARGET_LANG: &str = "Korean";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// User-facing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master switch; off means no session runs.
    pub enabled: bool,
    /// Language name passed to the OCR endpoint as `target_lang`.
    pub target_lang: String,
    /// Base URL of the OCR server.
    pub endpoint: String,
    /// Outer bound on a single OCR submission.
    pub ocr_timeout_secs: u64,
    /// Bound on any single image decode or load step.
    pub decode_timeout_secs: u64,
    /// Images narrower than this are treated as UI chrome.
    pub min_width: u32,
    /// Images shorter than this are treated as UI chrome.
    pub min_height: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_lang: DEFAULT_TARGET_LANG.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            ocr_timeout_secs: 120,
            decode_timeout_secs: 10,
            min_width: 200,
            min_height: 200,
        }
    }
}

impl Settings {
    /// Minimum natural size an image needs to be admitted.
    #[must_use]
    pub fn size_floor(&self) -> Dimensions {
        Dimensions::new(self.min_width, self.min_height)
    }

    #[must_use]
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    #[must_use]
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    /// Load settings from the default path.
    ///
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Load settings from an explicit path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist settings, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let body = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, body).map_err(write_err)
    }
}

/// Return the path to the settings file.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pageocr")
        .join("config.toml")
}

/// Publishes settings changes to every running session.
#[derive(Debug)]
pub struct SettingsStore {
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    #[must_use]
    pub fn new(initial: Settings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current snapshot.
    #[must_use]
    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// New receiver observing every subsequent change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Apply an edit and notify subscribers if anything changed.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        self.tx.send_if_modified(|settings| {
            let before = settings.clone();
            edit(settings);
            *settings != before
        });
    }
}
