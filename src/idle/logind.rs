//! Idle detection via systemd-logind `DBus` interface.
//!
//! Reads `IdleHint` and `IdleSinceHint` from the current session. logind only
//! flips the hint when the desktop reports idleness, so samples are coarse:
//! zero while active, time since the hint was raised while idle.

use std::env;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::trace;
use zbus::Connection;

use super::IdleProbe;
use super::IdleSample;
use super::ProbeError;

/// `DBus` service and path for login1.
const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Idle probe that queries systemd-logind for the session idle hint.
pub struct LogindIdleProbe {
    conn: Connection,

    /// Session object path, resolved once at connect.
    session_path: String,
}

impl LogindIdleProbe {
    /// Connect to the system bus and resolve the current session.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .context("Failed to connect to system DBus")?;

        let session_path = resolve_session_path(&conn).await?;
        info!("Resolved session path: {}", session_path);

        Ok(Self { conn, session_path })
    }
}

#[async_trait]
impl IdleProbe for LogindIdleProbe {
    async fn sample(&self) -> Result<IdleSample, ProbeError> {
        let idle = get_idle_hint(&self.conn, &self.session_path)
            .await
            .map_err(|e| ProbeError::Unavailable(format!("{e:#}")))?;

        if !idle {
            trace!("logind IdleHint: false");
            return Ok(IdleSample::from_millis(0));
        }

        let since_us = get_idle_since_hint(&self.conn, &self.session_path)
            .await
            .map_err(|e| ProbeError::Unavailable(format!("{e:#}")))?;

        let ms = idle_ms_since(since_us, SystemTime::now());
        trace!("logind IdleHint: true, idle for {}ms", ms);
        Ok(IdleSample::from_millis(ms))
    }

    fn name(&self) -> &'static str {
        "logind"
    }
}

/// Milliseconds between a realtime microsecond timestamp and `now`.
fn idle_ms_since(since_us: u64, now: SystemTime) -> u64 {
    let now_us = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();

    let elapsed_ms = now_us.saturating_sub(u128::from(since_us)) / 1000;
    u64::try_from(elapsed_ms).unwrap_or(u64::MAX)
}

/// Resolve the session object path for the current session.
async fn resolve_session_path(conn: &Connection) -> Result<String> {
    // First try XDG_SESSION_ID if available
    if let Ok(session_id) = env::var("XDG_SESSION_ID") {
        debug!("Using XDG_SESSION_ID: {}", session_id);

        let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, LOGIND_PATH, MANAGER_INTERFACE)
            .await
            .context("Failed to create Manager proxy")?;

        let path: zbus::zvariant::OwnedObjectPath = proxy
            .call("GetSession", &(&session_id,))
            .await
            .context("GetSession call failed")?;

        return Ok(path.to_string());
    }

    debug!("XDG_SESSION_ID not set, trying to find current session");

    // Probe "self" then "auto" by reading IdleHint
    for name in ["self", "auto"] {
        let path = format!("{LOGIND_PATH}/session/{name}");
        if get_idle_hint(conn, &path).await.is_ok() {
            return Ok(path);
        }
    }

    anyhow::bail!(
        "Could not resolve session path. Set XDG_SESSION_ID or ensure logind session is available."
    )
}

/// Read one property of the session object.
async fn get_session_property(
    conn: &Connection,
    session_path: &str,
    property: &str,
) -> Result<zbus::zvariant::OwnedValue> {
    let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, session_path, PROPERTIES_INTERFACE)
        .await
        .context("Failed to create Properties proxy")?;

    proxy
        .call("Get", &(SESSION_INTERFACE, property))
        .await
        .with_context(|| format!("Failed to get {property} property"))
}

/// Get the `IdleHint` property from a session.
async fn get_idle_hint(conn: &Connection, session_path: &str) -> Result<bool> {
    let value = get_session_property(conn, session_path, "IdleHint").await?;

    value
        .downcast_ref::<bool>()
        .map_err(|_| anyhow::anyhow!("IdleHint is not a boolean"))
}

/// Get `IdleSinceHint` (microseconds since the epoch) from a session.
async fn get_idle_since_hint(conn: &Connection, session_path: &str) -> Result<u64> {
    let value = get_session_property(conn, session_path, "IdleSinceHint").await?;

    value
        .downcast_ref::<u64>()
        .map_err(|_| anyhow::anyhow!("IdleSinceHint is not a u64"))
}
