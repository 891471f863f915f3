//! Jiggler settings and their persistent store.
//!
//! Settings are validated before they ever reach the store, swapped in
//! atomically, then written to disk on a best-effort basis.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Default idle threshold (2 minutes).
pub const DEFAULT_IDLE_THRESHOLD_MS: u64 = 120_000;

/// Default interval between ticks (1 minute).
pub const DEFAULT_JIGGLE_INTERVAL_MS: u64 = 60_000;

/// Settings field names, used in validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    IdleThresholdMs,
    JiggleIntervalMs,
}

impl SettingsField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleThresholdMs => "idle_threshold_ms",
            Self::JiggleIntervalMs => "jiggle_interval_ms",
        }
    }
}

impl fmt::Display for SettingsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected settings input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: SettingsField,
    pub reason: String,
}

/// Validated jiggler settings.
///
/// Both values are strictly positive. A threshold smaller than the interval
/// is allowed, it just makes jiggling near-continuous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    idle_threshold_ms: u64,
    jiggle_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            jiggle_interval_ms: DEFAULT_JIGGLE_INTERVAL_MS,
        }
    }
}

impl Settings {
    /// Build settings from raw integers, rejecting non-positive values.
    pub fn new(idle_threshold_ms: i64, jiggle_interval_ms: i64) -> Result<Self, ValidationError> {
        Ok(Self {
            idle_threshold_ms: positive(SettingsField::IdleThresholdMs, idle_threshold_ms)?,
            jiggle_interval_ms: positive(SettingsField::JiggleIntervalMs, jiggle_interval_ms)?,
        })
    }

    pub fn idle_threshold_ms(&self) -> u64 {
        self.idle_threshold_ms
    }

    pub fn jiggle_interval_ms(&self) -> u64 {
        self.jiggle_interval_ms
    }

    pub fn jiggle_interval(&self) -> Duration {
        Duration::from_millis(self.jiggle_interval_ms)
    }

    /// `(idle_threshold_ms, jiggle_interval_ms)`, the shape front ends read.
    pub fn as_tuple(&self) -> (u64, u64) {
        (self.idle_threshold_ms, self.jiggle_interval_ms)
    }

    /// Re-check invariants on values that bypassed `new` (deserialized).
    fn validate(self) -> Result<Self, ValidationError> {
        if self.idle_threshold_ms == 0 {
            return Err(not_positive(SettingsField::IdleThresholdMs, 0));
        }
        if self.jiggle_interval_ms == 0 {
            return Err(not_positive(SettingsField::JiggleIntervalMs, 0));
        }
        Ok(self)
    }
}

fn positive(field: SettingsField, value: i64) -> Result<u64, ValidationError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| not_positive(field, value))
}

fn not_positive(field: SettingsField, value: i64) -> ValidationError {
    ValidationError {
        field,
        reason: format!("must be a positive number of milliseconds, got {value}"),
    }
}

/// Owns the live settings value and its on-disk copy.
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Settings>,

    /// Serializes disk writes; never held by readers.
    persist: Mutex<()>,

    path: Option<PathBuf>,
}

impl SettingsStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Settings::default()),
            persist: Mutex::new(()),
            path: None,
        }
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let settings = match read_settings(&path) {
            Ok(Some(settings)) => {
                info!(
                    "Loaded settings from {}: threshold={}ms interval={}ms",
                    path.display(),
                    settings.idle_threshold_ms,
                    settings.jiggle_interval_ms
                );
                settings
            }
            Ok(None) => {
                debug!("No settings at {}, using defaults", path.display());
                Settings::default()
            }
            Err(e) => {
                warn!("Ignoring settings file: {:#}", e);
                Settings::default()
            }
        };

        Self {
            current: RwLock::new(settings),
            persist: Mutex::new(()),
            path: Some(path),
        }
    }

    /// Default location: `$XDG_CONFIG_HOME/auraflowd/settings.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("auraflowd").join("settings.toml"))
    }

    /// Current settings. Never fails.
    pub fn get(&self) -> Settings {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the settings and persist them.
    ///
    /// Validation happens before anything is mutated. Persistence failures
    /// are logged, the in-memory value stays updated.
    pub fn update(&self, new: Settings) -> Result<(), ValidationError> {
        let new = new.validate()?;

        if new.idle_threshold_ms < new.jiggle_interval_ms {
            warn!(
                "Idle threshold {}ms is below jiggle interval {}ms; jiggling will be near-continuous",
                new.idle_threshold_ms, new.jiggle_interval_ms
            );
        }

        // Holding the persist lock across the swap keeps file writes in
        // update order without making readers wait on disk I/O.
        let _persist = match self.persist.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match self.current.write() {
            Ok(mut guard) => *guard = new,
            Err(poisoned) => *poisoned.into_inner() = new,
        }

        if let Some(ref path) = self.path
            && let Err(e) = write_settings(path, &new)
        {
            warn!("Failed to persist settings: {:#}", e);
        }

        info!(
            "Settings updated: threshold={}ms interval={}ms",
            new.idle_threshold_ms, new.jiggle_interval_ms
        );
        Ok(())
    }
}

fn read_settings(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    let settings: Settings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
    let settings = settings
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;

    Ok(Some(settings))
}

fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let content = toml::to_string(settings).context("Failed to serialize settings")?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!("Persisted settings to {}", path.display());
    Ok(())
}
