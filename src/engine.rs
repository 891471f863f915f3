//! Jiggler engine state machine.
//!
//! One tick task per run. Every tick takes the engine lock, so `start`,
//! `stop` and tick evaluation never interleave:
//! - Sleep for the *current* jiggle interval (re-read after every tick)
//! - Sample idle time; at or above the threshold, nudge the pointer
//! - Consecutive tick failures up to the limit are reported and retried;
//!   reaching the limit stops the engine

use std::sync::Arc;
use std::sync::MutexGuard;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::events::EventSink;
use crate::events::JiggleEvent;
use crate::events::StatusEvent;
use crate::idle::IdleProbe;
use crate::idle::IdleSample;
use crate::idle::ProbeError;
use crate::input::InjectError;
use crate::input::InjectGate;
use crate::input::InputInjector;
use crate::settings::Settings;
use crate::settings::SettingsStore;

pub const STATUS_MONITORING: &str = "Monitoring...";
pub const STATUS_READY: &str = "Ready";
pub const STATUS_IDLE_DETECTED: &str = "Idle detected - starting auto-jiggle";
pub const STATUS_ACTIVITY_DETECTED: &str = "Activity detected - pausing jiggler";

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How much lower than "time since our nudge" a sample must be before it
/// counts as the user coming back.
const ACTIVITY_SLACK: Duration = Duration::from_secs(1);

/// Misuse of the start/stop state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("Jiggler is already running")]
    AlreadyRunning,

    #[error("Jiggler is not running")]
    NotRunning,
}

/// A single failed tick. Never surfaced to callers, only as a status event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Inject(#[from] InjectError),
}

/// Engine tuning that does not change while running.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Consecutive failed ticks that force the engine to stop.
    pub max_consecutive_failures: u32,

    /// Upper bound on a single probe or inject call.
    pub probe_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Run state; owned by the engine and only touched under its lock.
#[derive(Debug)]
enum EngineState {
    Stopped,
    Running(RunState),
}

/// Ends a run without taking the engine lock.
#[derive(Debug, Clone, Default)]
struct RunHandle {
    cancel: CancellationToken,
    gate: InjectGate,
}

impl RunHandle {
    fn end(&self) {
        self.cancel.cancel();
        self.gate.close();
    }
}

#[derive(Debug)]
struct RunState {
    handle: RunHandle,
    task: JoinHandle<()>,

    /// Ticks evaluated in this run.
    ticks: u64,

    consecutive_failures: u32,

    /// Set once idle crosses the threshold, cleared on genuine activity.
    idle_episode: bool,

    last_injection: Option<Instant>,
}

/// What a tick asks the loop to do next.
#[derive(Debug)]
enum TickOutcome {
    Continue,
    Fatal(String),
}

struct Shared {
    state: Mutex<EngineState>,
    settings: Arc<SettingsStore>,
    probe: Arc<dyn IdleProbe>,
    injector: Arc<dyn InputInjector>,
    events: Arc<EventSink>,
    options: EngineOptions,
}

/// Owns the run/stop state and the tick schedule.
pub struct JigglerEngine {
    shared: Arc<Shared>,

    /// Latest run's handle, reachable while a tick holds the engine lock.
    live: std::sync::Mutex<Option<RunHandle>>,
}

impl JigglerEngine {
    pub fn new(
        settings: Arc<SettingsStore>,
        probe: Arc<dyn IdleProbe>,
        injector: Arc<dyn InputInjector>,
        events: Arc<EventSink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::Stopped),
                settings,
                probe,
                injector,
                events,
                options,
            }),
            live: std::sync::Mutex::new(None),
        }
    }

    /// Begin monitoring. The first tick fires one interval from now.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock().await;
        if matches!(*state, EngineState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }

        let handle = RunHandle::default();
        let task = tokio::spawn(tick_loop(Arc::clone(&self.shared), handle.cancel.clone()));
        *self.live() = Some(handle.clone());

        *state = EngineState::Running(RunState {
            handle,
            task,
            ticks: 0,
            consecutive_failures: 0,
            idle_episode: false,
            last_injection: None,
        });

        let settings = self.shared.settings.get();
        info!(
            "Jiggler started (probe={}, injector={}, threshold={}ms, interval={}ms)",
            self.shared.probe.name(),
            self.shared.injector.name(),
            settings.idle_threshold_ms(),
            settings.jiggle_interval_ms()
        );
        self.shared.events.emit(StatusEvent::info(STATUS_MONITORING));
        Ok(())
    }

    /// Stop monitoring. No tick acts after this returns.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock().await;
        let EngineState::Running(run) = std::mem::replace(&mut *state, EngineState::Stopped) else {
            return Err(EngineError::NotRunning);
        };

        // Holding the lock means no tick is mid-evaluation; the task is either
        // sleeping or waiting on this lock, and both exits are covered. Closing
        // the gate also stops inject work abandoned by an earlier timeout.
        run.handle.end();
        run.task.abort();
        self.live().take();

        info!("Jiggler stopped after {} ticks", run.ticks);
        self.shared.events.emit(StatusEvent::info(STATUS_READY));
        Ok(())
    }

    /// Stop if running; used on process shutdown.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(EngineError::NotRunning) => {}
            Err(e) => warn!("Unexpected shutdown error: {}", e),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.shared.state.lock().await, EngineState::Running(_))
    }

    /// Ticks evaluated in the current run, 0 when stopped.
    pub async fn tick_count(&self) -> u64 {
        match &*self.shared.state.lock().await {
            EngineState::Running(run) => run.ticks,
            EngineState::Stopped => 0,
        }
    }
}

impl JigglerEngine {
    fn live(&self) -> MutexGuard<'_, Option<RunHandle>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for JigglerEngine {
    fn drop(&mut self) {
        // A tick may be holding the engine lock; the loop exits on its own
        // once the token is cancelled.
        if let Some(handle) = self.live().take() {
            handle.end();
        }
    }
}

async fn tick_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let interval = shared.settings.get().jiggle_interval();
        trace!("Next tick in {:?}", interval);

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let mut state = shared.state.lock().await;

        // stop() may have won the lock while this tick was waiting for it.
        if cancel.is_cancelled() {
            break;
        }
        let EngineState::Running(ref mut run) = *state else {
            break;
        };

        let outcome = shared.tick(run).await;
        match outcome {
            TickOutcome::Continue => {}
            TickOutcome::Fatal(message) => {
                run.handle.end();
                *state = EngineState::Stopped;
                error!("{}", message);
                shared.events.emit(StatusEvent::error(message));
                break;
            }
        }
    }

    debug!("Tick loop exited");
}

impl Shared {
    async fn tick(&self, run: &mut RunState) -> TickOutcome {
        run.ticks += 1;
        let tick = run.ticks;

        // Always the latest settings, never a snapshot from start().
        let settings = self.settings.get();

        match self.evaluate(run, tick, settings).await {
            Ok(()) => {
                run.consecutive_failures = 0;
                TickOutcome::Continue
            }
            // The run ended mid-tick; the loop exits on the cancelled token.
            Err(TickError::Inject(InjectError::Cancelled)) => TickOutcome::Continue,
            Err(e) => {
                run.consecutive_failures += 1;
                let failures = run.consecutive_failures;
                let max = self.options.max_consecutive_failures;

                if failures >= max {
                    return TickOutcome::Fatal(format!(
                        "Jiggler stopped after {failures} consecutive failures: {e}"
                    ));
                }

                warn!("Tick {} failed ({}/{}): {}", tick, failures, max, e);
                self.events
                    .emit(StatusEvent::warning(format!("Tick failed ({failures}/{max}): {e}")));
                TickOutcome::Continue
            }
        }
    }

    async fn evaluate(
        &self,
        run: &mut RunState,
        tick: u64,
        settings: Settings,
    ) -> Result<(), TickError> {
        let sample = self.sample().await?;
        let idle_ms = sample.as_millis();

        if idle_ms < settings.idle_threshold_ms() {
            debug!(
                "Tick {}: idle {} below threshold {}ms",
                tick,
                sample,
                settings.idle_threshold_ms()
            );

            if run.idle_episode && is_genuine_activity(sample, run.last_injection) {
                run.idle_episode = false;
                info!("Tick {}: user activity detected", tick);
                self.events.emit(StatusEvent::info(STATUS_ACTIVITY_DETECTED));
            }
            return Ok(());
        }

        if !run.idle_episode {
            run.idle_episode = true;
            info!("Tick {}: idle for {}, starting auto-jiggle", tick, sample);
            self.events.emit(StatusEvent::info(STATUS_IDLE_DETECTED));
        }

        let inject = self.injector.inject(&run.handle.gate);
        let nudge = tokio::time::timeout(self.options.probe_timeout, inject)
            .await
            .map_err(|_| {
                InjectError::Denied(format!("timed out after {:?}", self.options.probe_timeout))
            })??;
        run.last_injection = Some(Instant::now());

        debug!("Tick {}: jiggled after {} idle", tick, sample);
        self.events.emit(JiggleEvent {
            idle_ms,
            tick,
            dx: nudge.dx,
            dy: nudge.dy,
        });
        Ok(())
    }

    async fn sample(&self) -> Result<IdleSample, ProbeError> {
        tokio::time::timeout(self.options.probe_timeout, self.probe.sample())
            .await
            .map_err(|_| {
                ProbeError::Unavailable(format!("timed out after {:?}", self.options.probe_timeout))
            })?
    }
}

/// True when the idle reading is lower than our own nudge explains.
fn is_genuine_activity(sample: IdleSample, last_injection: Option<Instant>) -> bool {
    let Some(injected_at) = last_injection else {
        return true;
    };
    let since_nudge = injected_at.elapsed();
    Duration::from_millis(sample.as_millis()) + ACTIVITY_SLACK < since_nudge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use crate::events::EventSubscription;
    use crate::input::PointerNudge;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    /// Replays scripted samples, then repeats `fallback`.
    struct ScriptedProbe {
        samples: std::sync::Mutex<VecDeque<Result<u64, ProbeError>>>,
        fallback: u64,
    }

    impl ScriptedProbe {
        fn new(samples: Vec<Result<u64, ProbeError>>, fallback: u64) -> Arc<Self> {
            Arc::new(Self {
                samples: std::sync::Mutex::new(samples.into()),
                fallback,
            })
        }

        fn constant(ms: u64) -> Arc<Self> {
            Self::new(Vec::new(), ms)
        }
    }

    #[async_trait]
    impl IdleProbe for ScriptedProbe {
        async fn sample(&self) -> Result<IdleSample, ProbeError> {
            let next = self.samples.lock().unwrap().pop_front();
            next.unwrap_or(Ok(self.fallback)).map(IdleSample::from_millis)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct CountingInjector {
        calls: AtomicUsize,
        denied: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl InputInjector for CountingInjector {
        async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError> {
            if self.denied.load(Ordering::SeqCst) {
                return Err(InjectError::Denied("secure input".to_string()));
            }
            gate.admit(|| {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(PointerNudge { dx: 1, dy: 0 })
            })
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Harness {
        engine: JigglerEngine,
        settings: Arc<SettingsStore>,
        injector: Arc<CountingInjector>,
        events: EventSubscription,
    }

    fn harness(probe: Arc<ScriptedProbe>, threshold_ms: i64, interval_ms: i64) -> Harness {
        let settings = Arc::new(SettingsStore::in_memory());
        settings
            .update(Settings::new(threshold_ms, interval_ms).unwrap())
            .unwrap();
        let injector = Arc::new(CountingInjector::default());
        let sink = Arc::new(EventSink::new());
        let events = sink.subscribe();
        let engine = JigglerEngine::new(
            Arc::clone(&settings),
            probe,
            Arc::clone(&injector) as Arc<dyn InputInjector>,
            sink,
            EngineOptions::default(),
        );
        Harness {
            engine,
            settings,
            injector,
            events,
        }
    }

    /// Wait (in paused time) for the next jiggle event.
    async fn next_jiggle(events: &mut EventSubscription) -> JiggleEvent {
        loop {
            match events.recv().await {
                Some(EngineEvent::Jiggle(jiggle)) => return jiggle,
                Some(EngineEvent::Status(_)) => {}
                None => panic!("event sink closed"),
            }
        }
    }

    fn statuses(events: &mut EventSubscription) -> Vec<StatusEvent> {
        events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Status(s) => Some(s),
                EngineEvent::Jiggle(_) => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_already_running() {
        let mut h = harness(ScriptedProbe::constant(0), 60_000, 5000);

        h.engine.start().await.unwrap();
        assert_eq!(h.engine.start().await, Err(EngineError::AlreadyRunning));
        assert!(h.engine.is_running().await);

        assert_eq!(statuses(&mut h.events), vec![StatusEvent::info(STATUS_MONITORING)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let mut h = harness(ScriptedProbe::constant(0), 60_000, 5000);
        assert_eq!(h.engine.stop().await, Err(EngineError::NotRunning));
        assert!(h.events.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_example_scenario() {
        let probe = ScriptedProbe::new(vec![Ok(65_000), Ok(2000)], 0);
        let mut h = harness(probe, 60_000, 5000);
        h.engine.start().await.unwrap();

        let jiggle = next_jiggle(&mut h.events).await;
        assert_eq!(jiggle.idle_ms, 65_000);
        assert_eq!(jiggle.tick, 1);
        assert_eq!(jiggle.to_string(), "65000ms idle");

        // Second tick reads 2000ms and must not inject.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(h.engine.tick_count().await, 2);
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), 1);
        assert!(h.events.drain().iter().all(|e| !matches!(e, EngineEvent::Jiggle(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_idle_ticks_inject_n_times() {
        let probe = ScriptedProbe::new(vec![Ok(70_000), Ok(75_000), Ok(80_000)], 0);
        let mut h = harness(probe, 60_000, 1000);
        h.engine.start().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_jiggle(&mut h.events).await.idle_ms);
        }
        assert_eq!(seen, vec![70_000, 75_000, 80_000]);

        // Further ticks read 0 idle
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_injection_after_stop() {
        let mut h = harness(ScriptedProbe::constant(90_000), 60_000, 1000);
        h.engine.start().await.unwrap();
        next_jiggle(&mut h.events).await;

        h.engine.stop().await.unwrap();
        let calls = h.injector.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), calls);
        assert_eq!(statuses(&mut h.events), vec![StatusEvent::info(STATUS_READY)]);
        assert!(!h.engine.is_running().await);
        assert_eq!(h.engine.tick_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_tick_source() {
        let h = harness(ScriptedProbe::constant(90_000), 60_000, 1000);

        for _ in 0..5 {
            h.engine.start().await.unwrap();
            h.engine.stop().await.unwrap();
        }
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        // One tick per second from a single schedule.
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), 10);
        assert_eq!(h.engine.tick_count().await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_from_next_tick() {
        let mut h = harness(ScriptedProbe::constant(90_000), 1000, 5000);
        let started = Instant::now();
        h.engine.start().await.unwrap();

        next_jiggle(&mut h.events).await;
        let first = started.elapsed();
        assert!(first >= Duration::from_millis(5000) && first < Duration::from_millis(5010));

        // The second tick is already scheduled at the old interval.
        h.settings.update(Settings::new(1000, 2000).unwrap()).unwrap();

        next_jiggle(&mut h.events).await;
        let second = started.elapsed();
        assert!(second >= Duration::from_millis(10_000) && second < Duration::from_millis(10_010));

        next_jiggle(&mut h.events).await;
        let third = started.elapsed();
        assert!(third >= Duration::from_millis(12_000) && third < Duration::from_millis(12_020));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_change_applies_without_restart() {
        let mut h = harness(ScriptedProbe::constant(30_000), 60_000, 1000);
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), 0);

        h.settings.update(Settings::new(20_000, 1000).unwrap()).unwrap();
        let jiggle = next_jiggle(&mut h.events).await;
        assert_eq!(jiggle.idle_ms, 30_000);
        assert_eq!(jiggle.tick, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_do_not_stop() {
        let unavailable = || Err(ProbeError::Unavailable("no display".to_string()));
        let probe = ScriptedProbe::new(
            vec![unavailable(), unavailable(), unavailable(), unavailable(), Ok(65_000)],
            0,
        );
        let mut h = harness(probe, 60_000, 1000);
        h.engine.start().await.unwrap();

        let mut warnings = 0;
        let jiggle = loop {
            match h.events.recv().await.unwrap() {
                EngineEvent::Jiggle(jiggle) => break jiggle,
                EngineEvent::Status(s) if s.level == crate::events::StatusLevel::Warning => {
                    assert!(s.message.starts_with(&format!("Tick failed ({}/5)", warnings + 1)));
                    warnings += 1;
                }
                EngineEvent::Status(_) => {}
            }
        };
        assert_eq!(warnings, 4);
        assert_eq!(jiggle.tick, 5);
        assert!(h.engine.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_count_resets_on_success() {
        let unavailable = || Err(ProbeError::Unavailable("flaky".to_string()));
        let mut samples = Vec::new();
        for _ in 0..3 {
            samples.extend([unavailable(), unavailable(), unavailable(), unavailable(), Ok(0)]);
        }
        let h = harness(ScriptedProbe::new(samples, 0), 60_000, 1000);
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert!(h.engine.is_running().await);
        assert_eq!(h.engine.tick_count().await, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_force_stop() {
        let h = harness(ScriptedProbe::constant(90_000), 60_000, 1000);
        h.injector.denied.store(true, Ordering::SeqCst);
        let mut events = h.events;
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(!h.engine.is_running().await);

        let got = statuses(&mut events);
        let warnings = got.iter().filter(|s| s.level == crate::events::StatusLevel::Warning);
        assert_eq!(warnings.count(), 4);

        let last = got.last().unwrap();
        assert_eq!(last.level, crate::events::StatusLevel::Error);
        assert!(last.message.contains("5 consecutive failures"));
        assert!(last.message.contains("secure input"));

        // Nothing else happens until an explicit start.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.drain().is_empty());
        assert_eq!(h.engine.stop().await, Err(EngineError::NotRunning));

        h.injector.denied.store(false, Ordering::SeqCst);
        h.engine.start().await.unwrap();
        next_jiggle(&mut events).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_and_activity_statuses() {
        // Idle, then self-caused low reading, then genuine activity.
        let probe = ScriptedProbe::new(vec![Ok(65_000), Ok(5000), Ok(100), Ok(65_000)], 0);
        let mut h = harness(probe, 60_000, 5000);
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20_500)).await;

        let messages: Vec<_> = statuses(&mut h.events).into_iter().map(|s| s.message).collect();
        assert_eq!(
            messages,
            vec![
                STATUS_MONITORING,
                STATUS_IDLE_DETECTED,
                STATUS_ACTIVITY_DETECTED,
                STATUS_IDLE_DETECTED,
            ]
        );
        assert_eq!(h.injector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        struct HangingProbe;

        #[async_trait]
        impl IdleProbe for HangingProbe {
            async fn sample(&self) -> Result<IdleSample, ProbeError> {
                std::future::pending().await
            }

            fn name(&self) -> &'static str {
                "hanging"
            }
        }

        let sink = Arc::new(EventSink::new());
        let mut events = sink.subscribe();
        let engine = JigglerEngine::new(
            Arc::new(SettingsStore::in_memory()),
            Arc::new(HangingProbe),
            Arc::new(CountingInjector::default()),
            sink,
            EngineOptions {
                max_consecutive_failures: 2,
                probe_timeout: Duration::from_millis(100),
            },
        );
        engine.start().await.unwrap();

        // Default interval is 60s; two timed-out ticks stop the engine.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(!engine.is_running().await);

        let got = statuses(&mut events);
        assert!(got[1].message.contains("timed out"));
        assert_eq!(got.last().unwrap().level, crate::events::StatusLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_injection_never_lands_after_stop() {
        /// Hands the nudge to a task that outlives the caller's timeout.
        #[derive(Default)]
        struct DetachedInjector {
            calls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl InputInjector for DetachedInjector {
            async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError> {
                let gate = gate.clone();
                let calls = Arc::clone(&self.calls);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    gate.admit(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(PointerNudge { dx: 1, dy: 0 })
                    })
                })
                .await
                .map_err(|e| InjectError::Denied(e.to_string()))?
            }

            fn name(&self) -> &'static str {
                "detached"
            }
        }

        let settings = Arc::new(SettingsStore::in_memory());
        settings.update(Settings::new(60_000, 1000).unwrap()).unwrap();
        let injector = Arc::new(DetachedInjector::default());
        let sink = Arc::new(EventSink::new());
        let mut events = sink.subscribe();
        let engine = JigglerEngine::new(
            settings,
            ScriptedProbe::constant(90_000),
            Arc::clone(&injector) as Arc<dyn InputInjector>,
            sink,
            EngineOptions {
                max_consecutive_failures: 5,
                probe_timeout: Duration::from_millis(100),
            },
        );
        engine.start().await.unwrap();

        // Tick at 1000ms times out at 1100ms; its nudge is still pending.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.stop().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(injector.calls.load(Ordering::SeqCst), 0);
        assert!(events.drain().iter().all(|e| !matches!(e, EngineEvent::Jiggle(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_mid_tick_ends_run() {
        struct CountedProbe {
            samples: AtomicUsize,
        }

        #[async_trait]
        impl IdleProbe for CountedProbe {
            async fn sample(&self) -> Result<IdleSample, ProbeError> {
                self.samples.fetch_add(1, Ordering::SeqCst);
                Ok(IdleSample::from_millis(90_000))
            }

            fn name(&self) -> &'static str {
                "counted"
            }
        }

        /// Holds the tick (and the engine lock) until released.
        #[derive(Default)]
        struct HeldInjector {
            release: tokio::sync::Notify,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl InputInjector for HeldInjector {
            async fn inject(&self, gate: &InjectGate) -> Result<PointerNudge, InjectError> {
                self.release.notified().await;
                gate.admit(|| {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(PointerNudge { dx: 1, dy: 0 })
                })
            }

            fn name(&self) -> &'static str {
                "held"
            }
        }

        let settings = Arc::new(SettingsStore::in_memory());
        settings.update(Settings::new(60_000, 1000).unwrap()).unwrap();
        let probe = Arc::new(CountedProbe {
            samples: AtomicUsize::new(0),
        });
        let injector = Arc::new(HeldInjector::default());
        let engine = JigglerEngine::new(
            settings,
            Arc::clone(&probe) as Arc<dyn IdleProbe>,
            Arc::clone(&injector) as Arc<dyn InputInjector>,
            Arc::new(EventSink::new()),
            EngineOptions {
                max_consecutive_failures: 5,
                probe_timeout: Duration::from_secs(60),
            },
        );
        engine.start().await.unwrap();

        // First tick is parked inside inject, holding the engine lock.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(probe.samples.load(Ordering::SeqCst), 1);

        drop(engine);
        injector.release.notify_one();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(injector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.samples.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_genuine_activity_without_injection() {
        assert!(is_genuine_activity(IdleSample::from_millis(500), None));
    }
}
