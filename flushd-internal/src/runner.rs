//! Wires the daemon together and supervises its two long-running components.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::authorizer::Authorizer;
use crate::backend::http::{BackendConfig, HttpUsageBackend};
use crate::backend::UsageBackend;
use crate::error::{Error, ErrorDetails};
use crate::flusher::{Flusher, FlusherConfig};
use crate::priority_auth_renewer::{PriorityAuthRenewer, PriorityAuthRenewerConfig};
use crate::redis_client::RedisStore;
use crate::storage::{Storage, StorageConfig};

const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub redis_url: String,
    pub backend: BackendConfig,
    pub storage: StorageConfig,
    pub flusher: FlusherConfig,
    pub renewer: PriorityAuthRenewerConfig,
}

/// Accepts `host`, `host:port` or a full `redis://` URL.
pub fn normalize_redis_url(raw: &str) -> Result<String, Error> {
    let mut url = parse_with_default_scheme(raw, "redis")?;
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_REDIS_PORT)).map_err(|()| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid Redis URL `{raw}`: cannot set a port"),
            })
        })?;
    }
    Ok(url.to_string())
}

/// Accepts `host[:port]` or a full URL. Scheme-less hosts are reached over https.
pub fn normalize_backend_url(raw: &str) -> Result<Url, Error> {
    parse_with_default_scheme(raw, "https")
}

fn parse_with_default_scheme(raw: &str, scheme: &str) -> Result<Url, Error> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{scheme}://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| {
        Error::new_without_logging(ErrorDetails::Config {
            message: format!("Invalid URL `{raw}`: {e}"),
        })
    })?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::new_without_logging(ErrorDetails::Config {
            message: format!("Invalid URL `{raw}`: missing host"),
        }));
    }
    Ok(url)
}

/// Connect to the store and backend, then run the flusher and the priority
/// renewer until `shutdown` is cancelled or one of them stops on its own.
///
/// The store is reached over three sessions: one for storage commands, one for
/// publishing priority responses and one dedicated to the request subscription.
pub async fn run(config: RunnerConfig, shutdown: CancellationToken) -> Result<(), Error> {
    let redis_url = normalize_redis_url(&config.redis_url)?;
    let store = Arc::new(RedisStore::new(&redis_url).await?);
    let publisher = Arc::new(RedisStore::new(&redis_url).await?);
    let subscriber = Arc::new(store.subscriber());
    info!(redis = %redis_url, backend = %config.backend.url, "Connected to Redis");

    let backend: Arc<dyn UsageBackend> = Arc::new(HttpUsageBackend::new(config.backend)?);
    let storage = Arc::new(Storage::new(store, config.storage));
    let authorizer = Arc::new(Authorizer::new(Arc::clone(&backend)));

    let flusher = Arc::new(Flusher::new(
        Arc::clone(&storage),
        backend,
        Arc::clone(&authorizer),
        config.flusher,
    ));
    let renewer = Arc::new(PriorityAuthRenewer::new(
        authorizer,
        storage,
        publisher,
        subscriber,
        config.renewer,
    ));

    let flusher_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { flusher.run(shutdown).await })
    };
    let renewer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { renewer.run(shutdown).await })
    };

    supervise(("flusher", flusher_task), ("priority auth renewer", renewer_task), &shutdown).await
}

/// Wait for either component to finish. Both are expected to run until
/// `shutdown` is cancelled; one stopping earlier, or panicking, takes the
/// other down and is reported as an error.
async fn supervise(
    first: (&'static str, JoinHandle<()>),
    second: (&'static str, JoinHandle<()>),
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let (first_name, mut first_task) = first;
    let (second_name, mut second_task) = second;

    let finished_first = tokio::select! {
        result = &mut first_task => (first_name, result, true),
        result = &mut second_task => (second_name, result, false),
    };
    let (name, result, first_finished) = finished_first;

    let stopped_early = !shutdown.is_cancelled();
    shutdown.cancel();
    let outcome = task_outcome(name, result, stopped_early);

    let (other_name, other_task) = if first_finished {
        (second_name, second_task)
    } else {
        (first_name, first_task)
    };
    let other_outcome = task_outcome(other_name, other_task.await, false);

    info!("flushd stopped");
    outcome.and(other_outcome)
}

fn task_outcome(
    name: &str,
    result: Result<(), JoinError>,
    stopped_early: bool,
) -> Result<(), Error> {
    match result {
        Err(e) => Err(Error::new_without_logging(ErrorDetails::InternalError {
            message: format!("The {name} task failed: {e}"),
        })),
        Ok(()) if stopped_early => Err(Error::new_without_logging(ErrorDetails::InternalError {
            message: format!("The {name} stopped before shutdown was requested"),
        })),
        Ok(()) => Ok(()),
    }
}
