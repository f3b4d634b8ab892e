//! aiOS fswatch: filesystem activity observer
//!
//! Responsibilities:
//! - Load configuration from /etc/aios/fswatch.toml (or CLI overrides)
//! - Open an inotify session and register every configured root
//! - Wait for activity, decode it, print one line per event
//! - Exit cleanly on SIGINT/SIGTERM, non-zero on any fatal error

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aios_fswatch::config::{self, OutputFormat};
use aios_fswatch::{EmitSink, EventLoop, InotifySession, JsonSink, TextSink, WatchRegistry};

#[derive(Debug, Parser)]
#[command(name = "aios-fswatch", version, about = "Report open/close activity under watched directories")]
struct Cli {
    /// Config file (defaults to $AIOS_FSWATCH_CONFIG or /etc/aios/fswatch.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Output format for events
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Directories to watch; replaces watch.roots from the config
    roots: Vec<PathBuf>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGTERM, Signal::SIGINT];

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("FATAL: aios-fswatch failed: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = config::config_path(cli.config.as_deref());
    let mut config = config::load_config(&path)?;
    if !cli.roots.is_empty() {
        config.watch.roots = cli.roots;
    }
    if let Some(format) = cli.format {
        config.output.format = format;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging.level)?;
    info!("aiOS fswatch v{}", env!("CARGO_PKG_VERSION"));
    if path.exists() {
        info!("Configuration loaded from {}", path.display());
    } else {
        warn!("Config file not found at {}, using defaults", path.display());
    }

    let mut session = InotifySession::open().map_err(aios_fswatch::WatchError::Session)?;
    let mut registry = WatchRegistry::new();
    for root in &config.watch.roots {
        registry.register(&mut session, root)?;
    }

    let sink: Box<dyn EmitSink> = match config.output.format {
        OutputFormat::Text => Box::new(TextSink::new(io::stdout().lock())),
        OutputFormat::Json => Box::new(JsonSink::new(io::stdout().lock())),
    };

    let wait_mask = setup_signal_handlers()?;

    let mut event_loop = EventLoop::new(
        session.with_signal_mask(wait_mask),
        registry,
        sink,
        config.watch.buffer_size,
        config.watch.unknown_watch,
    );
    let result = event_loop.run(&SHUTDOWN);
    let stats = event_loop.stats();
    info!(
        "{} batches, {} events emitted, {} skipped, {} overflows",
        stats.batches, stats.emitted, stats.skipped, stats.overflows
    );
    result?;

    info!("Clean shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;

    // Events go to stdout, diagnostics to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Install the shutdown handlers and block their signals outside the wait.
///
/// Returns the mask the readiness wait should run with: the previous mask
/// with SIGTERM and SIGINT unblocked.
fn setup_signal_handlers() -> Result<SigSet> {
    use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigmaskHow};

    // No SA_RESTART: the readiness wait must return EINTR so the loop sees the flag
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let mut shutdown_signals = SigSet::empty();
    for signal in SHUTDOWN_SIGNALS {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {signal} handler"))?;
        shutdown_signals.add(signal);
    }

    let mut wait_mask = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&shutdown_signals), Some(&mut wait_mask))
        .context("Failed to block shutdown signals")?;
    for signal in SHUTDOWN_SIGNALS {
        wait_mask.remove(signal);
    }
    Ok(wait_mask)
}

extern "C" fn handle_shutdown(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}
