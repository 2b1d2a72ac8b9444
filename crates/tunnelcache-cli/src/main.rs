//! tunnelcache - simulation harness for the tunnelcache resolvers.
//!
//! Plays a scripted tunnel session against a simulated daemon whose calls
//! fail at random, printing every location and account update as it is
//! published. Use RUST_LOG to see the retry machinery at work
//! (e.g. `RUST_LOG=tunnelcache_core=debug`).

mod simulation;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunnelcache_core::models::{RelaySelection, TunnelState};
use tunnelcache_core::{account_data_cache, location_resolver, Settings};

use simulation::{run_script, SimulatedDaemon};

// ============================================================================
// Constants
// ============================================================================

/// Grace period for the orchestration tasks to wind down after shutdown
const SHUTDOWN_GRACE_MS: u64 = 50;

const USAGE: &str = "usage: tunnelcache [--failure-rate F] [--latency-ms N] \
                     [--log-file PATH] [--json] [--save-config]";

/// Command line options; anything not given falls back to settings
#[derive(Debug, Default)]
struct Args {
    failure_rate: Option<f64>,
    latency_ms: Option<u64>,
    log_file: Option<PathBuf>,
    json: bool,
    save_config: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--failure-rate" => {
                    let value = args.next().context("--failure-rate needs a value")?;
                    let rate: f64 = value
                        .parse()
                        .with_context(|| format!("invalid failure rate: {}", value))?;
                    ensure!(rate.is_finite(), "failure rate must be finite: {}", value);
                    parsed.failure_rate = Some(rate);
                }
                "--latency-ms" => {
                    let value = args.next().context("--latency-ms needs a value")?;
                    parsed.latency_ms = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid latency: {}", value))?,
                    );
                }
                "--log-file" => {
                    let value = args.next().context("--log-file needs a path")?;
                    parsed.log_file = Some(PathBuf::from(value));
                }
                "--json" => parsed.json = true,
                "--save-config" => parsed.save_config = true,
                "-h" | "--help" => {
                    println!("{}", USAGE);
                    std::process::exit(0);
                }
                other => bail!("unknown argument: {}\n{}", other, USAGE),
            }
        }
        Ok(parsed)
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; with a log file they are also written there through a
/// non-blocking appender whose guard must outlive the program.
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse(std::env::args().skip(1))?;
    let _guard = init_tracing(args.log_file.as_ref())?;
    info!("tunnelcache starting");

    let mut settings = Settings::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load settings, using defaults");
        Settings::default()
    });
    settings.apply_env_overrides();
    if let Some(rate) = args.failure_rate {
        settings.simulation.failure_rate = rate.clamp(0.0, 1.0);
    }
    if let Some(latency) = args.latency_ms {
        settings.simulation.latency_ms = latency;
    }

    if args.save_config {
        settings.save().context("failed to save settings")?;
        let path = Settings::config_path()?;
        println!("Settings written to {}", path.display());
        return Ok(());
    }

    let location_schedule = settings
        .location
        .schedule()
        .context("invalid location schedule")?;
    let account_schedule = settings
        .account
        .schedule()
        .context("invalid account schedule")?;

    let daemon = SimulatedDaemon::new(
        settings.simulation.failure_rate,
        Duration::from_millis(settings.simulation.latency_ms),
    );
    info!(
        failure_rate = settings.simulation.failure_rate,
        latency_ms = settings.simulation.latency_ms,
        "Simulated daemon ready"
    );

    let json = args.json;
    let selection = RelaySelection::default();
    let location = location_resolver(
        daemon.clone(),
        selection.clone(),
        location_schedule,
        TunnelState::Disconnected,
        true,
    );
    location.subscribe(move |value| {
        if json {
            println!("{}", json!({ "at": Utc::now(), "location": value }));
        } else {
            match value {
                Some(loc) => println!("location  {}", loc.describe()),
                None => println!("location  (unknown)"),
            }
        }
    });

    let account = account_data_cache(daemon.clone(), account_schedule, |data| {
        info!(expiry = %data.expiry, "Account data updated");
    });
    account.subscribe(move |value| {
        if json {
            let remaining_secs = value.map(|data| data.remaining().num_seconds());
            println!(
                "{}",
                json!({ "at": Utc::now(), "account": value, "remaining_secs": remaining_secs })
            );
        } else {
            match value {
                Some(data) if data.is_expired() => println!("account   expired"),
                Some(data) => println!("account   {}", data.formatted_remaining_time()),
                None => println!("account   (logged out)"),
            }
        }
    });

    run_script(daemon, &location, &account, &selection).await;

    location.shutdown();
    account.shutdown();
    tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;

    info!("tunnelcache shutting down");
    Ok(())
}
