//! gpsd-core: a GPS/AIS/NMEA2000 location-service daemon.
//!
//! Usage:
//!   gpsd-core -N -F /var/run/gpsd.sock /dev/ttyUSB0
//!   gpsd-core -n -S 2947 /dev/ttyUSB0 /dev/ttyACM0

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use gpsd_core::config::{self, DaemonConfig};
use gpsd_core::context::Context;
use gpsd_core::engine::Engine;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "gpsd-core", version, about = "GPS/AIS/NMEA2000 location-service daemon")]
struct Cli {
    /// Control socket path.
    #[arg(short = 'F', long = "control-socket")]
    control_socket: Option<PathBuf>,

    /// Debug verbosity level.
    #[arg(short = 'D', long = "debug", default_value_t = 0)]
    debug: u8,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'N', long = "foreground")]
    foreground: bool,

    /// TCP port the client protocol listens on.
    #[arg(short = 'S', long = "port", default_value_t = config::DEFAULT_GPSD_PORT)]
    port: u16,

    /// Where to write the daemon's pid.
    #[arg(short = 'P', long = "pidfile")]
    pidfile: Option<PathBuf>,

    /// Don't wait for a client before opening devices.
    #[arg(short = 'n', long = "no-wait")]
    no_wait: bool,

    /// Device paths or DGPS/NTRIP URLs (dgpsip://, ntrip://).
    devices: Vec<String>,
}

// ── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.foreground, cli.debug).expect("failed to set up logging");

    let cfg = DaemonConfig {
        control_socket: cli.control_socket.clone(),
        debug_level: cli.debug,
        foreground: cli.foreground,
        port: cli.port,
        pid_file: cli.pidfile.clone(),
        no_wait: cli.no_wait,
        devices: cli.devices.clone(),
    };

    if let Err(e) = config::validate_config(&cfg) {
        error!("configuration error: {e}");
        process::exit(1);
    }
    if cfg.devices.is_empty() && !cfg.no_wait {
        error!("no devices given and -n not set; nothing to open");
        process::exit(1);
    }

    if let Some(path) = &cfg.pid_file {
        if let Err(e) = write_pid_file(path) {
            error!("cannot write PID file {}: {e}", path.display());
        }
    }

    info!(
        "gpsd-core starting (port={}, control_socket={:?}, devices={:?})",
        cfg.port, cfg.control_socket, cfg.devices
    );

    let ctx = Arc::new(Context::new());
    let engine = Engine::new(cfg.clone(), ctx);

    let exit_code = tokio::select! {
        result = engine.run() => {
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("engine exited with error: {e}");
                    2
                }
            }
        }
        sig = wait_for_terminating_signal() => {
            info!("received signal {sig}, shutting down");
            10 + sig
        }
    };

    if let Some(path) = &cfg.pid_file {
        remove_pid_file(path);
    }
    process::exit(exit_code);
}

/// Waits for SIGTERM or SIGINT, returning the signal number (§6's `10+signum`
/// exit-code convention).
async fn wait_for_terminating_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => 15,
        _ = sigint.recv() => 2,
    }
}

// ── PID file ─────────────────────────────────────────────────────────────────

fn write_pid_file(path: &std::path::Path) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    writeln!(f, "{}", process::id())?;
    Ok(())
}

fn remove_pid_file(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("failed to remove PID file {}: {e}", path.display());
    }
}

// ── Logging setup ────────────────────────────────────────────────────────────

/// Foreground runs log to stderr via `env_logger`; daemonized runs log to
/// syslog, matching the teacher's `setup_logging` split.
fn setup_logging(foreground: bool, debug_level: u8) -> anyhow::Result<()> {
    let level = match debug_level {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if foreground {
        env_logger::Builder::from_default_env().filter_level(level).init();
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "gpsd-core".into(),
            pid: process::id(),
        };
        let logger = syslog::unix(formatter).map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    }
    Ok(())
}
