//! X11 idle probe backed by the MIT-SCREEN-SAVER extension.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::trace;
use x11rb::protocol::screensaver::ConnectionExt as _;

use super::IdleProbe;
use super::IdleSample;
use super::ProbeError;
use crate::x11::Extension;
use crate::x11::X11Session;

/// Reads `ms_since_user_input` from the X server.
pub struct X11IdleProbe {
    session: Arc<X11Session>,
}

impl X11IdleProbe {
    pub fn new(session: Arc<X11Session>) -> Result<Self> {
        session.require(Extension::ScreenSaver)?;
        Ok(Self { session })
    }
}

#[async_trait]
impl IdleProbe for X11IdleProbe {
    async fn sample(&self) -> Result<IdleSample, ProbeError> {
        let session = Arc::clone(&self.session);

        // The reply is a server round trip, keep it off the async workers.
        let ms = tokio::task::spawn_blocking(move || query_idle_ms(&session))
            .await
            .map_err(|e| ProbeError::Unavailable(format!("probe task failed: {e}")))??;

        trace!("X11 idle: {}ms", ms);
        Ok(IdleSample::from_millis(ms))
    }

    fn name(&self) -> &'static str {
        "x11-screensaver"
    }
}

fn query_idle_ms(session: &X11Session) -> Result<u64, ProbeError> {
    let reply = session
        .conn()
        .screensaver_query_info(session.root())
        .map_err(|e| ProbeError::Unavailable(format!("QueryInfo request failed: {e}")))?
        .reply()
        .map_err(|e| ProbeError::Unavailable(format!("QueryInfo reply failed: {e}")))?;

    Ok(u64::from(reply.ms_since_user_input))
}
