use std::fmt::Display;
use std::net::SocketAddr;

use clap::ValueEnum;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "flushd=info,flushd_internal=info";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn setup_logs(format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Pretty => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to install the log subscriber: {e}"),
            })
        })
}

/// Serve the process counters in the Prometheus text format on `listen_address`.
///
/// Without an address no recorder is installed and counters are discarded.
pub fn setup_metrics(listen_address: Option<SocketAddr>) -> Result<(), Error> {
    let Some(address) = listen_address else {
        tracing::info!("Metrics exporter disabled");
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to start the metrics exporter on {address}: {e}"),
            })
        })?;
    tracing::info!(%address, "Serving metrics");
    Ok(())
}
