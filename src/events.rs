//! One-way event channel from the engine to its observers.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::trace;

/// Severity of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Human-readable engine state or error notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub level: StatusLevel,
    pub message: String,
}

impl StatusEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Error,
            message: message.into(),
        }
    }
}

/// Emitted every time synthetic input was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JiggleEvent {
    /// Idle duration observed on the tick that triggered the jiggle.
    pub idle_ms: u64,
    /// Tick number within the current run.
    pub tick: u64,
    pub dx: i16,
    pub dy: i16,
}

impl fmt::Display for JiggleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms idle", self.idle_ms)
    }
}

/// Everything the engine can tell its observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineEvent {
    Status(StatusEvent),
    Jiggle(JiggleEvent),
}

impl From<StatusEvent> for EngineEvent {
    fn from(event: StatusEvent) -> Self {
        Self::Status(event)
    }
}

impl From<JiggleEvent> for EngineEvent {
    fn from(event: JiggleEvent) -> Self {
        Self::Jiggle(event)
    }
}

/// Fan-out sink with one unbounded queue per subscriber.
///
/// `emit` never waits on a subscriber. Each subscriber sees events in the
/// order they were emitted.
#[derive(Debug, Default)]
pub struct EventSink {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Only events emitted afterwards are seen.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        EventSubscription { rx }
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: impl Into<EngineEvent>) {
        let event = event.into();
        trace!("Emitting {:?}", event);

        // Dropped receivers are pruned on the way through.
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of subscribers still attached.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<EngineEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Receiving end handed to an observer.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
