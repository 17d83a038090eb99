//! prefork: pre-fork HTTP worker pool.
//!
//! This is the process entry point. It initializes tracing, resolves the pool
//! configuration from the config file, CLI flags and `PORT`, starts the
//! supervisor with the default application, and waits for SIGTERM/SIGINT.
//! The `healthcheck` and `probe` subcommands poll a running instance instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prefork::config::{
    AppConfig, LoggingConfig, Overrides, DEFAULT_HEALTHCHECK_URL, DEFAULT_LOG_FILTER,
    PORT_ENV_VAR, PROBE_TIMEOUT_SECS,
};
use prefork::http::shutdown_signal;
use prefork::probe::{HealthProber, ProbePolicy};
use prefork::routes::create_router;
use prefork::{ExitReason, Supervisor, WorkerConfig};

/// prefork: a pre-fork HTTP worker pool supervisor
#[derive(Parser, Debug)]
#[command(name = "prefork", version, about)]
struct Args {
    /// Path to configuration file (optional, all keys have defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (e.g., "prefork=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Request timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Keep-alive idle time in seconds (0 disables keep-alive)
    #[arg(short, long)]
    keep_alive: Option<u64>,

    /// Address to bind, host:port (default 0.0.0.0:$PORT)
    #[arg(short, long)]
    bind: Option<String>,

    /// Seconds in-flight requests get to finish on shutdown
    #[arg(short, long)]
    graceful_timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe a liveness endpoint once; exit 0 when healthy
    Healthcheck {
        #[arg(long, default_value = DEFAULT_HEALTHCHECK_URL)]
        url: String,
        /// Probe timeout in seconds
        #[arg(long, default_value_t = PROBE_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Poll a liveness endpoint until it is judged down
    Probe {
        #[arg(long, default_value = DEFAULT_HEALTHCHECK_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load_or_default(args.config.as_deref())?;
    init_tracing(args.log_level.clone(), &config.logging);

    match args.command {
        Some(Command::Healthcheck { url, timeout }) => {
            let policy = ProbePolicy {
                timeout: Duration::from_secs(timeout),
                ..ProbePolicy::default()
            };
            let prober = HealthProber::new(url, policy)?;
            return Ok(match prober.probe_once().await {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(url = %prober.url(), error = %e, "Health check failed");
                    ExitCode::FAILURE
                }
            });
        }
        Some(Command::Probe { url }) => {
            let prober = HealthProber::new(url, ProbePolicy::default())?;
            prober.watch().await;
            return Ok(ExitCode::FAILURE);
        }
        None => {}
    }

    let overrides = Overrides {
        workers: args.workers,
        timeout_seconds: args.timeout,
        keep_alive_seconds: args.keep_alive,
        bind: args.bind,
    };
    let port_env = std::env::var(PORT_ENV_VAR).ok();
    let worker_config = WorkerConfig::resolve(&config.server, &overrides, port_env.as_deref())?;
    let grace = args
        .graceful_timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.server.graceful_timeout());

    tracing::info!("Loaded configuration");

    let handle = Supervisor::start(worker_config, Arc::new(create_router())).await?;
    tracing::info!("Serving at http://{}", handle.local_addr());

    let reason = tokio::select! {
        signal = shutdown_signal() => {
            tracing::info!(
                signal,
                grace_secs = grace.as_secs(),
                "Graceful shutdown initiated"
            );
            handle.shutdown(grace).await
        }
        reason = handle.stopped() => reason,
    };

    Ok(match reason {
        ExitReason::Shutdown => ExitCode::SUCCESS,
        ExitReason::RestartsExhausted | ExitReason::SupervisorLost => ExitCode::FAILURE,
    })
}

/// Initialize tracing with priority: CLI > env > default
fn init_tracing(cli_filter: Option<String>, logging: &LoggingConfig) {
    let log_filter = cli_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));

    if logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
