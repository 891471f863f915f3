//! Synthetic input injection.
//!
//! An injector nudges the pointer by a pixel and back. The OS counts that as
//! activity, so the next idle sample reads near zero until real idle time
//! accumulates again.

mod xtest;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::x11::X11Session;

pub use xtest::X11Injector;

/// Pointer displacement applied by one injection.
///
/// Injectors move out by `(dx, dy)` and straight back, so the pointer rests
/// where it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerNudge {
    pub dx: i16,
    pub dy: i16,
}

impl PointerNudge {
    /// Horizontal nudge of `distance` pixels.
    pub fn horizontal(distance: u16) -> Self {
        Self {
            dx: i16::try_from(distance).unwrap_or(i16::MAX),
            dy: 0,
        }
    }
}

/// Errors from injecting synthetic input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("Synthetic input denied: {0}")]
    Denied(String),

    #[error("Synthetic input cancelled: jiggler stopped")]
    Cancelled,
}

/// Admits synthetic input only while the run that owns it is live.
///
/// `close` waits for a write already in progress, so nothing reaches the
/// display once it returns. Work that outlived its caller (a timed-out
/// blocking task) finds the gate closed and sends nothing.
#[derive(Debug, Clone, Default)]
pub struct InjectGate {
    closed: Arc<Mutex<bool>>,
}

impl InjectGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        *self.lock() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.lock()
    }

    /// Run `send` while holding the gate open, or fail with `Cancelled`.
    pub fn admit<T>(
        &self,
        send: impl FnOnce() -> Result<T, InjectError>,
    ) -> Result<T, InjectError> {
        let closed = self.lock();
        if *closed {
            return Err(InjectError::Cancelled);
        }
        send()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Performs one imperceptible synthetic input action.
#[async_trait]
pub trait InputInjector: Send + Sync {
    /// Every write to the display goes through `gate.admit`.
    async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Injector that only logs what it would have done.
#[derive(Debug)]
pub struct DryRunInjector {
    nudge: PointerNudge,
}

impl DryRunInjector {
    pub fn new(distance: u16) -> Self {
        Self {
            nudge: PointerNudge::horizontal(distance),
        }
    }
}

#[async_trait]
impl InputInjector for DryRunInjector {
    async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError> {
        gate.admit(|| {
            info!(
                "[DRY RUN] Would nudge pointer by ({:+}, {:+}) and back",
                self.nudge.dx, self.nudge.dy
            );
            Ok(self.nudge)
        })
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

/// Construct the configured injector.
pub fn build_injector(
    dry_run: bool,
    distance: u16,
    x11: Option<Arc<X11Session>>,
) -> Result<Arc<dyn InputInjector>> {
    if dry_run {
        return Ok(Arc::new(DryRunInjector::new(distance)));
    }

    let session = match x11 {
        Some(session) => session,
        None => Arc::new(X11Session::connect()?),
    };
    Ok(Arc::new(X11Injector::new(session, distance)?))
}
