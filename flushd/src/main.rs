use clap::Parser;
use mimalloc::MiMalloc;
use secrecy::SecretString;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use flushd_internal::backend::http::{BackendConfig, DEFAULT_BACKEND_TIMEOUT};
use flushd_internal::error::Error;
use flushd_internal::flusher::FlusherConfig;
use flushd_internal::observability::{self, LogFormat};
use flushd_internal::priority_auth_renewer::PriorityAuthRenewerConfig;
use flushd_internal::runner::{self, RunnerConfig};
use flushd_internal::storage::StorageConfig;
use flushd_internal::worker_pool::PoolConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Usage backend, as `host[:port]` or a full URL.
    #[arg(long, env = "FLUSHD_BACKEND")]
    backend: String,

    /// Provider key used to authenticate against the backend.
    #[arg(long, env = "FLUSHD_PROVIDER_KEY", hide_env_values = true)]
    provider_key: String,

    /// Redis shared with the gateways, as `host[:port]` or a `redis://` URL.
    #[arg(long, env = "FLUSHD_REDIS", default_value = "redis://localhost:6379")]
    redis: String,

    /// Seconds between flush cycles.
    #[arg(long, default_value_t = 300)]
    frequency: u64,

    /// Seconds a renewed authorization stays cached.
    #[arg(long, default_value_t = 900)]
    auth_ttl: u64,

    /// Seconds before a backend request times out.
    #[arg(long, default_value_t = DEFAULT_BACKEND_TIMEOUT.as_secs())]
    backend_timeout: u64,

    /// Worker range for the flusher, as `min:max` or `max`.
    #[arg(long)]
    threads_flusher: Option<PoolConfig>,

    /// Worker range for the priority auth renewer, as `min:max` or `max`.
    #[arg(long)]
    threads_prio_auth_renewer: Option<PoolConfig>,

    /// Serve Prometheus metrics on this address, e.g. `0.0.0.0:9090`. Disabled when unset.
    #[arg(long, env = "FLUSHD_METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,

    /// Sets the log format used for all logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

fn runner_config(args: Args) -> Result<RunnerConfig, Error> {
    let auth_ttl = Duration::from_secs(args.auth_ttl);
    Ok(RunnerConfig {
        redis_url: args.redis,
        backend: BackendConfig {
            url: runner::normalize_backend_url(&args.backend)?,
            provider_key: SecretString::from(args.provider_key),
            timeout: Duration::from_secs(args.backend_timeout),
        },
        storage: StorageConfig::default(),
        flusher: FlusherConfig {
            frequency: Duration::from_secs(args.frequency),
            auth_ttl,
            pool: args.threads_flusher.unwrap_or_default(),
            ..Default::default()
        },
        renewer: PriorityAuthRenewerConfig {
            auth_ttl,
            pool: args.threads_prio_auth_renewer.unwrap_or_default(),
            ..Default::default()
        },
    })
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs immediately, so that we can use `tracing`.
    observability::setup_logs(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting flushd {}", env!("CARGO_PKG_VERSION"));

    observability::setup_metrics(args.metrics_address).expect_pretty("Failed to set up metrics");

    if args.frequency == 0 {
        tracing::error!("`--frequency` must be at least 1 second");
        std::process::exit(1);
    }

    let config = runner_config(args).expect_pretty("Invalid configuration");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    if let Err(e) = runner::run(config, shutdown).await {
        tracing::error!("flushd stopped with an error: {e}");
        std::process::exit(1);
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// `expect_pretty` will log an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
