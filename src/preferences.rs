//! Bridge preferences
//!
//! Persisted launch settings for the agent app-server. A supervisor does not
//! read these itself; callers load preferences, turn them into
//! [`StartOptions`](crate::bridge::StartOptions), and pass them to `start`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default bind host forwarded to the agent
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default bind port forwarded to the agent
pub const DEFAULT_PORT: u16 = 3928;

/// Launch settings for the agent app-server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgePreferences {
    /// Path to the agent binary
    pub binary_path: String,
    /// Working directory for the agent process
    pub working_directory: Option<String>,
    /// Bind host forwarded as `--host`
    pub host: String,
    /// Bind port forwarded as `--port`
    pub port: u16,
}

impl Default for BridgePreferences {
    fn default() -> Self {
        Self {
            binary_path: String::new(),
            working_directory: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Error types for preferences persistence
#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse preferences: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Trait for loading and saving preferences
///
/// The file-backed store is the production implementation; tests use
/// [`MemoryPreferencesStore`].
pub trait PreferencesStore: Send + Sync {
    /// Load preferences, falling back to defaults when none are stored
    fn load(&self) -> Result<BridgePreferences, PreferencesError>;

    /// Persist preferences
    fn save(&self, preferences: &BridgePreferences) -> Result<(), PreferencesError>;
}

/// Preferences persisted as pretty-printed JSON at a fixed path
pub struct FilePreferencesStore {
    path: PathBuf,
}

impl FilePreferencesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferencesStore for FilePreferencesStore {
    fn load(&self) -> Result<BridgePreferences, PreferencesError> {
        if !self.path.exists() {
            debug!(
                "No preferences file at {}, using defaults",
                self.path.display()
            );
            return Ok(BridgePreferences::default());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let preferences = serde_json::from_str(&contents)?;
        Ok(preferences)
    }

    fn save(&self, preferences: &BridgePreferences) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(preferences)?;
        std::fs::write(&self.path, contents)?;
        debug!("Saved preferences to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store for tests
pub struct MemoryPreferencesStore {
    preferences: std::sync::Mutex<Option<BridgePreferences>>,
}

impl MemoryPreferencesStore {
    pub fn new() -> Self {
        Self {
            preferences: std::sync::Mutex::new(None),
        }
    }
}

impl Default for MemoryPreferencesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferencesStore for MemoryPreferencesStore {
    fn load(&self) -> Result<BridgePreferences, PreferencesError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default())
    }

    fn save(&self, preferences: &BridgePreferences) -> Result<(), PreferencesError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.preferences.lock().unwrap() = Some(preferences.clone());
        Ok(())
    }
}
