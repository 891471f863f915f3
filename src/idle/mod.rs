//! Idle detection backends.
//!
//! A probe reports how long the session has gone without genuine user input.
//! Samples are always taken fresh; nothing here caches idle time across ticks.

mod logind;
mod screensaver;

use std::env;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::x11::X11Session;

pub use logind::LogindIdleProbe;
pub use screensaver::X11IdleProbe;

/// Milliseconds since the last genuine input, as read on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdleSample(u64);

impl IdleSample {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdleSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Errors from querying the OS for idle time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Idle probe unavailable: {0}")]
    Unavailable(String),
}

/// Source of idle-time samples.
#[async_trait]
pub trait IdleProbe: Send + Sync {
    /// Read the current idle duration.
    ///
    /// Implementations must return in bounded time; the engine additionally
    /// wraps each call in a timeout.
    async fn sample(&self) -> Result<IdleSample, ProbeError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Which probe backend to use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeBackend {
    /// X11 when `DISPLAY` is set, logind otherwise.
    #[default]
    Auto,
    X11,
    Logind,
}

/// Construct the configured probe.
///
/// `x11` is reused when the caller already holds a session.
pub async fn connect_probe(
    backend: ProbeBackend,
    x11: Option<Arc<X11Session>>,
) -> Result<Arc<dyn IdleProbe>> {
    match backend {
        ProbeBackend::X11 => Ok(Arc::new(X11IdleProbe::new(x11_session(x11)?)?)),
        ProbeBackend::Logind => Ok(Arc::new(LogindIdleProbe::connect().await?)),
        ProbeBackend::Auto => {
            if env::var_os("DISPLAY").is_some() {
                match x11_session(x11).and_then(X11IdleProbe::new) {
                    Ok(probe) => return Ok(Arc::new(probe)),
                    Err(e) => warn!("X11 idle probe unavailable ({:#}), trying logind", e),
                }
            }
            info!("Using logind idle probe");
            Ok(Arc::new(LogindIdleProbe::connect().await?))
        }
    }
}

fn x11_session(existing: Option<Arc<X11Session>>) -> Result<Arc<X11Session>> {
    match existing {
        Some(session) => Ok(session),
        None => Ok(Arc::new(X11Session::connect()?)),
    }
}

/// Environment relevant to backend selection, for startup logs.
pub fn diagnostics() -> Vec<String> {
    ["DISPLAY", "XDG_SESSION_ID", "XDG_SESSION_TYPE"]
        .iter()
        .map(|var| match env::var(var) {
            Ok(v) => format!("{var}={v}"),
            Err(_) => format!("{var}: NOT SET"),
        })
        .collect()
}
