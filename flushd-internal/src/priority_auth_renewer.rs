//! On-demand renewal of authorizations requested by gateways.
//!
//! ## Design
//!
//! A gateway that misses an authorization in its cache publishes the
//! `(service, credentials, metric)` it needs on [`AUTH_REQUESTS_CHANNEL`] and
//! waits on the response channel named after that request. The renewer
//! resolves the authorizations of the whole application, stores them all and
//! publishes the requested one.
//!
//! The gateway may subscribe to its response channel after the answer was
//! first published, so the answer is published a few times with a growing
//! delay between attempts.
//!
//! ## Concurrency
//!
//! Requests are handled on their own [`WorkerPool`]. Identical requests that
//! arrive while one is being handled are dropped: they will be answered by the
//! in-flight one. The in-flight entry is removed when its task finishes, fails
//! or is cancelled.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorizer::Authorizer;
use crate::error::{Error, ErrorDetails};
use crate::flusher::default_shutdown_grace;
use crate::kv_store::{KeyValueStore, Subscriber};
use crate::storage::{duration_ms, Storage};
use crate::storage_keys::{parse_auth_request, AUTH_REQUESTS_CHANNEL};
use crate::worker_pool::{PoolConfig, WorkerPool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityAuthRenewerConfig {
    #[serde(default = "default_auth_ttl", with = "duration_ms")]
    pub auth_ttl: Duration,
    #[serde(default = "default_times_to_publish")]
    pub times_to_publish: u32,
    /// Attempt `n` (starting at 1) is followed by a wait of `n² × publish_delay_base`.
    #[serde(default = "default_publish_delay_base", with = "duration_ms")]
    pub publish_delay_base: Duration,
    #[serde(default = "default_subscribe_retry_delay", with = "duration_ms")]
    pub subscribe_retry_delay: Duration,
    #[serde(default = "default_shutdown_grace", with = "duration_ms")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_auth_ttl() -> Duration {
    Duration::from_secs(900)
}

fn default_times_to_publish() -> u32 {
    5
}

fn default_publish_delay_base() -> Duration {
    Duration::from_millis(20)
}

fn default_subscribe_retry_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for PriorityAuthRenewerConfig {
    fn default() -> Self {
        Self {
            auth_ttl: default_auth_ttl(),
            times_to_publish: default_times_to_publish(),
            publish_delay_base: default_publish_delay_base(),
            subscribe_retry_delay: default_subscribe_retry_delay(),
            shutdown_grace: default_shutdown_grace(),
            pool: PoolConfig::default(),
        }
    }
}

/// What happened to an incoming request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A task was started to answer it.
    Claimed,
    /// The same request is already being answered.
    Duplicate,
    /// The renewer is shutting down.
    Rejected,
}

struct Inner {
    authorizer: Arc<Authorizer>,
    storage: Arc<Storage>,
    publisher: Arc<dyn KeyValueStore>,
    in_flight: DashMap<String, Instant>,
    config: PriorityAuthRenewerConfig,
}

/// Removes its request from the in-flight map when dropped.
struct InFlightGuard {
    inner: Arc<Inner>,
    message: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some((_, started)) = self.inner.in_flight.remove(&self.message) {
            debug!(
                message = %self.message,
                elapsed = ?started.elapsed(),
                "Released authorization request"
            );
        }
    }
}

pub struct PriorityAuthRenewer {
    inner: Arc<Inner>,
    subscriber: Arc<dyn Subscriber>,
    pool: WorkerPool,
}

impl PriorityAuthRenewer {
    pub fn new(
        authorizer: Arc<Authorizer>,
        storage: Arc<Storage>,
        publisher: Arc<dyn KeyValueStore>,
        subscriber: Arc<dyn Subscriber>,
        config: PriorityAuthRenewerConfig,
    ) -> Self {
        let pool = WorkerPool::new("priority_auth_renewer", config.pool);
        Self {
            inner: Arc::new(Inner {
                authorizer,
                storage,
                publisher,
                in_flight: DashMap::new(),
                config,
            }),
            subscriber,
            pool,
        }
    }

    /// Listen for requests until `shutdown` is cancelled, then drain the worker pool.
    ///
    /// A failed or lost subscription is retried after
    /// [`PriorityAuthRenewerConfig::subscribe_retry_delay`].
    pub async fn run(&self, shutdown: CancellationToken) {
        let retry_delay = self.inner.config.subscribe_retry_delay;
        while !shutdown.is_cancelled() {
            match self.listen(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        "Subscription to authorization requests failed, retrying in {retry_delay:?}"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
        info!("Priority auth renewer stopping");
        self.pool.shutdown(self.inner.config.shutdown_grace).await;
    }

    async fn listen(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        let mut messages = self.subscriber.subscribe(AUTH_REQUESTS_CHANNEL).await?;
        info!(
            channel = AUTH_REQUESTS_CHANNEL,
            "Listening for authorization requests"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                message = messages.next() => match message {
                    Some(message) => {
                        self.handle_message(message.payload);
                    }
                    None => {
                        return Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                            message: "subscription to authorization requests was closed".to_string(),
                        }));
                    }
                },
            }
        }
    }

    /// Start answering `message` unless the same request is already being answered.
    pub fn handle_message(&self, message: String) -> RequestOutcome {
        match self.inner.in_flight.entry(message.clone()) {
            Entry::Occupied(_) => {
                debug!(message = %message, "Ignoring duplicate authorization request");
                metrics::counter!("flushd_priority_requests_ignored_total").increment(1);
                return RequestOutcome::Duplicate;
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }

        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            message,
        };
        let submitted = self.pool.submit(async move {
            let inner = Arc::clone(&guard.inner);
            if let Err(e) = inner.renew_and_publish(&guard.message).await {
                log_request_error(&guard.message, &e);
            }
            drop(guard);
        });
        match submitted {
            Ok(_) => {
                metrics::counter!("flushd_priority_requests_handled_total").increment(1);
                RequestOutcome::Claimed
            }
            Err(e) => {
                warn!(error = %e, "Dropping authorization request");
                RequestOutcome::Rejected
            }
        }
    }
}

impl Inner {
    async fn renew_and_publish(&self, message: &str) -> Result<(), Error> {
        let request = parse_auth_request(message)?;
        let auths = self
            .authorizer
            .authorizations(
                &request.service_id,
                &request.credentials,
                std::slice::from_ref(&request.metric),
            )
            .await?;
        self.storage
            .renew_auths(
                &request.service_id,
                &request.credentials,
                &auths,
                self.config.auth_ttl,
            )
            .await?;

        let Some(auth) = auths.get(&request.metric) else {
            return Err(Error::new_without_logging(ErrorDetails::InternalError {
                message: format!("No authorization resolved for metric `{}`", request.metric),
            }));
        };
        self.publish_repeatedly(&request.response_channel(), &auth.to_storage_value())
            .await;
        Ok(())
    }

    async fn publish_repeatedly(&self, channel: &str, payload: &str) {
        let times = self.config.times_to_publish;
        let mut failures = 0;
        for attempt in 1..=times {
            if let Err(e) = self.publisher.publish(channel, payload).await {
                failures += 1;
                debug!(error = %e, attempt, channel, "Failed to publish authorization");
            }
            if attempt < times {
                tokio::time::sleep(self.config.publish_delay_base * attempt * attempt).await;
            }
        }
        if failures == times {
            warn!(channel, "Could not publish authorization");
        }
    }
}

fn log_request_error(message: &str, e: &Error) {
    match e.get_details() {
        ErrorDetails::InvalidRequestMessage { .. } => {
            warn!(error = %e, "Ignoring malformed authorization request");
        }
        _ if e.is_transient() => {
            warn!(request = %message, error = %e, "Failed to renew requested authorization");
        }
        _ => {
            error!(request = %message, error = %e, "Failed to renew requested authorization");
        }
    }
}
