//! The four commands a front end may call.
//!
//! Each call resolves to exactly one success value or one error; the
//! transport that carries them is someone else's concern.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::engine::EngineError;
use crate::engine::JigglerEngine;
use crate::settings::Settings;
use crate::settings::SettingsStore;
use crate::settings::ValidationError;

/// Errors returned to command callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Jiggler is already running")]
    AlreadyRunning,

    #[error("Jiggler is not running")]
    NotRunning,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::AlreadyRunning => Self::AlreadyRunning,
            EngineError::NotRunning => Self::NotRunning,
        }
    }
}

/// Statically typed command surface over the engine and settings.
#[derive(Clone)]
pub struct CommandFacade {
    engine: Arc<JigglerEngine>,
    settings: Arc<SettingsStore>,
}

impl CommandFacade {
    pub fn new(engine: Arc<JigglerEngine>, settings: Arc<SettingsStore>) -> Self {
        Self { engine, settings }
    }

    pub async fn start_jiggler(&self) -> Result<String, CommandError> {
        debug!("Command: start_jiggler");
        self.engine.start().await?;
        Ok("Jiggler started".to_string())
    }

    pub async fn stop_jiggler(&self) -> Result<String, CommandError> {
        debug!("Command: stop_jiggler");
        self.engine.stop().await?;
        Ok("Jiggler stopped".to_string())
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    /// Validate and apply new settings. The running engine picks them up on
    /// its next tick.
    pub fn update_settings(
        &self,
        idle_threshold_ms: i64,
        jiggle_interval_ms: i64,
    ) -> Result<String, CommandError> {
        debug!(
            "Command: update_settings({}, {})",
            idle_threshold_ms, jiggle_interval_ms
        );
        let settings = Settings::new(idle_threshold_ms, jiggle_interval_ms)?;
        self.settings.update(settings)?;
        Ok("Settings updated".to_string())
    }

    pub fn engine(&self) -> &JigglerEngine {
        &self.engine
    }
}
