//! Pointer nudges through the XTEST extension.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::MOTION_NOTIFY_EVENT;
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::CURRENT_TIME;

use super::InjectError;
use super::InjectGate;
use super::InputInjector;
use super::PointerNudge;
use crate::x11::Extension;
use crate::x11::X11Session;

/// `FakeInput` detail flag for relative motion.
const RELATIVE_MOTION: u8 = 1;

/// Any device; lets the server use the core pointer.
const CORE_DEVICE: u8 = 0;

/// Moves the pointer with XTEST relative motion events.
pub struct X11Injector {
    session: Arc<X11Session>,
    nudge: PointerNudge,
}

impl X11Injector {
    pub fn new(session: Arc<X11Session>, distance: u16) -> Result<Self> {
        session.require(Extension::XTest)?;
        Ok(Self {
            session,
            nudge: PointerNudge::horizontal(distance),
        })
    }
}

#[async_trait]
impl InputInjector for X11Injector {
    async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError> {
        let session = Arc::clone(&self.session);
        let gate = gate.clone();
        let nudge = self.nudge;

        // The caller may time out and move on; the gate keeps this task from
        // writing to the display once the run has ended.
        tokio::task::spawn_blocking(move || {
            fake_motion(&session, &gate, nudge.dx, nudge.dy)?;
            fake_motion(&session, &gate, -nudge.dx, -nudge.dy)
        })
        .await
        .map_err(|e| InjectError::Denied(format!("inject task failed: {e}")))??;

        debug!("Nudged pointer by ({:+}, {:+}) and back", nudge.dx, nudge.dy);
        Ok(nudge)
    }

    fn name(&self) -> &'static str {
        "x11-xtest"
    }
}

fn fake_motion(
    session: &X11Session,
    gate: &InjectGate,
    dx: i16,
    dy: i16,
) -> Result<(), InjectError> {
    let conn = session.conn();

    // Request and flush happen inside the gate; only the reply wait is outside.
    let cookie = gate.admit(|| {
        let cookie = conn
            .xtest_fake_input(
                MOTION_NOTIFY_EVENT,
                RELATIVE_MOTION,
                CURRENT_TIME,
                session.root(),
                dx,
                dy,
                CORE_DEVICE,
            )
            .map_err(|e| InjectError::Denied(format!("FakeInput request failed: {e}")))?;
        conn.flush()
            .map_err(|e| InjectError::Denied(format!("flush failed: {e}")))?;
        Ok(cookie)
    })?;

    cookie
        .check()
        .map_err(|e| InjectError::Denied(format!("FakeInput rejected: {e}")))
}
