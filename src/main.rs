//! auraflowd - user daemon that keeps an idle session awake.
//!
//! Watches idle time and nudges the pointer once the user has been away
//! longer than the configured threshold.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use auraflowd::commands::CommandFacade;
use auraflowd::config::Config;
use auraflowd::engine::JigglerEngine;
use auraflowd::events::EngineEvent;
use auraflowd::events::EventSink;
use auraflowd::events::StatusLevel;
use auraflowd::idle;
use auraflowd::idle::ProbeBackend;
use auraflowd::input;
use auraflowd::x11::X11Session;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Idle jiggler daemon.
///
/// Nudges the pointer while the session is idle so it does not lock or go away.
#[derive(Parser, Debug)]
#[command(name = "auraflowd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (log nudges instead of moving the pointer).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print engine events to stdout as JSON lines.
    #[arg(long)]
    print_events: bool,

    /// Do not start jiggling until asked.
    #[arg(long)]
    no_autostart: bool,

    /// Sample the idle probe once, print the result and exit.
    #[arg(long)]
    probe_once: bool,

    /// Set and persist the idle threshold (milliseconds).
    #[arg(long, requires = "jiggle_interval_ms", allow_negative_numbers = true)]
    idle_threshold_ms: Option<i64>,

    /// Set and persist the jiggle interval (milliseconds).
    #[arg(long, requires = "idle_threshold_ms", allow_negative_numbers = true)]
    jiggle_interval_ms: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    info!("auraflowd v{} starting", env!("CARGO_PKG_VERSION"));

    for diag in idle::diagnostics() {
        debug!("{}", diag);
    }

    // Load config
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dry_run {
        config.dry_run = true;
    }
    if args.no_autostart {
        config.autostart = false;
    }

    info!(
        "Configuration loaded (probe={:?}, dry_run={})",
        config.probe_backend, config.dry_run
    );

    // One display connection serves both the probe and the injector.
    let x11 = open_x11(&config);

    let probe = idle::connect_probe(config.probe_backend, x11.clone())
        .await
        .context("Failed to initialize idle probe")?;

    if args.probe_once {
        let sample = probe.sample().await.context("Idle probe failed")?;
        println!("{} idle: {}", probe.name(), sample);
        return Ok(());
    }

    let injector = input::build_injector(config.dry_run, config.jiggle_distance_px, x11)
        .context("Failed to initialize input injector")?;

    let settings = Arc::new(config.settings_store());
    let events = Arc::new(EventSink::new());
    let engine = Arc::new(JigglerEngine::new(
        Arc::clone(&settings),
        probe,
        injector,
        Arc::clone(&events),
        config.engine_options(),
    ));
    let commands = CommandFacade::new(engine, settings);

    if let (Some(threshold), Some(interval)) = (args.idle_threshold_ms, args.jiggle_interval_ms) {
        let reply = commands
            .update_settings(threshold, interval)
            .context("Rejected settings")?;
        info!("{}", reply);
    }

    run_daemon(&commands, &events, config.autostart, args.print_events).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("auraflowd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Connect to X11 when some configured backend may need it.
fn open_x11(config: &Config) -> Option<Arc<X11Session>> {
    let needs_injector = !config.dry_run;
    let needs_probe = matches!(config.probe_backend, ProbeBackend::X11 | ProbeBackend::Auto);
    if !needs_injector && !needs_probe {
        return None;
    }

    match X11Session::connect() {
        Ok(session) => Some(Arc::new(session)),
        Err(e) => {
            warn!("X11 unavailable: {:#}", e);
            None
        }
    }
}

/// Run until SIGINT/SIGTERM, relaying engine events to the log.
async fn run_daemon(
    commands: &CommandFacade,
    events: &EventSink,
    autostart: bool,
    print_events: bool,
) -> Result<()> {
    let mut subscription = events.subscribe();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let settings = commands.get_settings();
    info!(
        "Settings: idle threshold {}ms, jiggle interval {}ms",
        settings.idle_threshold_ms(),
        settings.jiggle_interval_ms()
    );

    if autostart {
        let reply = commands.start_jiggler().await?;
        info!("{}", reply);
    } else {
        info!("Autostart disabled, jiggler idle");
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                handle_event(&event, print_events);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down");
                break;
            }
        }
    }

    commands.engine().shutdown().await;
    for event in subscription.drain() {
        handle_event(&event, print_events);
    }

    info!("auraflowd stopped");
    Ok(())
}

/// Log an engine event and optionally echo it to stdout.
fn handle_event(event: &EngineEvent, print_events: bool) {
    match event {
        EngineEvent::Status(status) => match status.level {
            StatusLevel::Info => info!("Status: {}", status.message),
            StatusLevel::Warning => warn!("Status: {}", status.message),
            StatusLevel::Error => error!("Status: {}", status.message),
        },
        EngineEvent::Jiggle(jiggle) => info!("Jiggle (tick {}): {}", jiggle.tick, jiggle),
    }

    if print_events {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to encode event: {}", e),
        }
    }
}
