//! Configuration loading and defaults for auraflowd.
//!
//! This is daemon wiring only. Jiggler settings (threshold and interval) live
//! in the settings store and change at runtime.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::DEFAULT_MAX_CONSECUTIVE_FAILURES;
use crate::engine::EngineOptions;
use crate::idle::ProbeBackend;
use crate::settings::SettingsStore;

/// Main configuration for auraflowd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Idle probe backend (default: auto).
    pub probe_backend: ProbeBackend,

    /// Pointer nudge distance in pixels (default: 1).
    pub jiggle_distance_px: u16,

    /// Consecutive failed ticks before the engine gives up (default: 5).
    pub max_consecutive_failures: u32,

    /// Upper bound for one idle probe or injection, in ms (default: 1000).
    pub probe_timeout_ms: u64,

    /// Where settings are persisted.
    /// If unset, uses ~/.config/auraflowd/settings.toml.
    pub settings_path: Option<PathBuf>,

    /// Start jiggling as soon as the daemon is up (default: true).
    pub autostart: bool,

    /// Dry run mode: log nudges instead of moving the pointer.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe_backend: ProbeBackend::default(),
            jiggle_distance_px: 1,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            probe_timeout_ms: 1000,
            settings_path: None,
            autostart: true,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("auraflowd").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.jiggle_distance_px == 0 {
            anyhow::bail!("jiggle_distance_px must be at least 1");
        }
        if self.max_consecutive_failures == 0 {
            anyhow::bail!("max_consecutive_failures must be at least 1");
        }
        if self.probe_timeout_ms == 0 {
            anyhow::bail!("probe_timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_consecutive_failures: self.max_consecutive_failures,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    /// Open the settings store at the configured or default location.
    pub fn settings_store(&self) -> SettingsStore {
        match self.settings_path.clone().or_else(SettingsStore::default_path) {
            Some(path) => SettingsStore::load(path),
            None => SettingsStore::in_memory(),
        }
    }
}
