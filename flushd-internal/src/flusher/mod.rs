//! Periodic synchronization with the usage backend.
//!
//! ## Cycle
//!
//! Every cycle claims the pending reports from [`Storage`], sends them to the
//! backend, waits a moment for the backend to account for them and then renews
//! the cached authorizations of every application that was reported. Each phase
//! fans out one task per application to the flusher's [`WorkerPool`] and waits
//! for all of them before the next phase starts.
//!
//! ## Cadence
//!
//! Cycles start every [`FlusherConfig::frequency`], measured from the start of
//! the previous cycle. A cycle that overruns the period is followed by the next
//! one right away. Between cycles the flusher idles in short slices so shutdown
//! is noticed quickly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authorization::Authorization;
use crate::authorizer::Authorizer;
use crate::backend::UsageBackend;
use crate::credentials::Credentials;
use crate::error::Error;
use crate::storage::{duration_ms, Report, Storage};
use crate::worker_pool::{PoolConfig, WorkerPool};

mod error_handler;

pub use error_handler::FlusherErrorHandler;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlusherConfig {
    #[serde(default = "default_frequency", with = "duration_ms")]
    pub frequency: Duration,
    #[serde(default = "default_auth_ttl", with = "duration_ms")]
    pub auth_ttl: Duration,
    /// Time given to the backend to account for reports before checking limits.
    #[serde(default = "default_settle_delay", with = "duration_ms")]
    pub settle_delay: Duration,
    #[serde(default = "default_idle_slice", with = "duration_ms")]
    pub idle_slice: Duration,
    #[serde(default = "default_shutdown_grace", with = "duration_ms")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_frequency() -> Duration {
    Duration::from_secs(300)
}

fn default_auth_ttl() -> Duration {
    Duration::from_secs(900)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_slice() -> Duration {
    Duration::from_secs(1)
}

pub(crate) fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            auth_ttl: default_auth_ttl(),
            settle_delay: default_settle_delay(),
            idle_slice: default_idle_slice(),
            shutdown_grace: default_shutdown_grace(),
            pool: PoolConfig::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    pub reports: usize,
    pub failed_reports: usize,
    pub authorized: usize,
    pub failed_authorizations: usize,
    pub renewed: usize,
    pub failed_renewals: usize,
}

struct AppAuths {
    service_id: String,
    credentials: Credentials,
    auths: HashMap<String, Authorization>,
}

pub struct Flusher {
    storage: Arc<Storage>,
    backend: Arc<dyn UsageBackend>,
    authorizer: Arc<Authorizer>,
    error_handler: FlusherErrorHandler,
    pool: WorkerPool,
    config: FlusherConfig,
}

impl Flusher {
    pub fn new(
        storage: Arc<Storage>,
        backend: Arc<dyn UsageBackend>,
        authorizer: Arc<Authorizer>,
        config: FlusherConfig,
    ) -> Self {
        Self {
            error_handler: FlusherErrorHandler::new(Arc::clone(&storage)),
            pool: WorkerPool::new("flusher", config.pool),
            storage,
            backend,
            authorizer,
            config,
        }
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// Cancellation closes the worker pool right away. A cycle in progress stops
    /// at its next phase boundary, and tasks it already submitted get
    /// [`FlusherConfig::shutdown_grace`] to finish before they are cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            frequency = ?self.config.frequency,
            auth_ttl = ?self.config.auth_ttl,
            "Flusher started"
        );
        let cycles = async {
            while !shutdown.is_cancelled() {
                let cycle_start = Instant::now();
                let summary = self.flush(&shutdown).await;
                debug!(?summary, elapsed = ?cycle_start.elapsed(), "Flush cycle finished");
                self.idle_until(cycle_start + self.config.frequency, &shutdown)
                    .await;
            }
        };
        let drain = async {
            shutdown.cancelled().await;
            info!("Flusher stopping");
            self.pool.shutdown(self.config.shutdown_grace).await;
        };
        tokio::join!(cycles, drain);
    }

    async fn idle_until(&self, next_cycle: Instant, shutdown: &CancellationToken) {
        let slice = self.config.idle_slice.max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= next_cycle || shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(slice.min(next_cycle - now)).await;
        }
    }

    /// One full cycle: claim, report, settle, authorize, renew.
    ///
    /// Stops early at a phase boundary once `shutdown` is cancelled. Usage whose
    /// report was cancelled is put back in the store like any failed report.
    pub async fn flush(&self, shutdown: &CancellationToken) -> FlushSummary {
        let reports = self.storage.reports_to_flush().await;
        let mut summary = FlushSummary {
            reports: reports.len(),
            ..Default::default()
        };
        if reports.is_empty() {
            return summary;
        }

        let reported = self.report(reports, &mut summary).await;
        if reported.is_empty() {
            return summary;
        }

        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(self.config.settle_delay) => {}
        }
        if shutdown.is_cancelled() {
            info!(reports = summary.reports, "Shutdown requested, skipping authorization renewal");
            return summary;
        }

        let authorized = self.authorize(&reported, &mut summary).await;
        if shutdown.is_cancelled() {
            info!(
                authorized = summary.authorized,
                "Shutdown requested, skipping storage of renewed authorizations"
            );
            return summary;
        }
        self.renew(authorized, &mut summary).await;

        info!(
            reports = summary.reports,
            failed_reports = summary.failed_reports,
            renewed = summary.renewed,
            "Flushed usage"
        );
        summary
    }

    async fn report(&self, reports: Vec<Report>, summary: &mut FlushSummary) -> Vec<Report> {
        let tasks = reports.iter().map(|report| {
            let backend = Arc::clone(&self.backend);
            let report = report.clone();
            async move {
                backend
                    .report(&report.service_id, &report.credentials, &report.usage)
                    .await
            }
        });
        let results = self.pool.scatter_gather(tasks).await;

        let mut succeeded = Vec::with_capacity(reports.len());
        let mut failed = Vec::new();
        for (report, result) in reports.into_iter().zip(results) {
            match result {
                Ok(()) => succeeded.push(report),
                Err(e) => failed.push((report, e)),
            }
        }
        summary.failed_reports = failed.len();
        metrics::counter!("flushd_reports_flushed_total").increment(succeeded.len() as u64);
        metrics::counter!("flushd_reports_failed_total").increment(failed.len() as u64);

        self.error_handler.handle_report_errors(failed).await;
        succeeded
    }

    async fn authorize(&self, reports: &[Report], summary: &mut FlushSummary) -> Vec<AppAuths> {
        let tasks = reports.iter().map(|report| {
            let authorizer = Arc::clone(&self.authorizer);
            let service_id = report.service_id.clone();
            let credentials = report.credentials.clone();
            let reported_metrics: Vec<String> = report.usage.keys().cloned().collect();
            async move {
                let auths = authorizer
                    .authorizations(&service_id, &credentials, &reported_metrics)
                    .await?;
                Ok::<_, Error>(AppAuths {
                    service_id,
                    credentials,
                    auths,
                })
            }
        });
        let results = self.pool.scatter_gather(tasks).await;

        let mut authorized = Vec::with_capacity(reports.len());
        for (report, result) in reports.iter().zip(results) {
            match result {
                Ok(app_auths) => authorized.push(app_auths),
                Err(e) => {
                    summary.failed_authorizations += 1;
                    self.error_handler
                        .handle_auth_error(&report.service_id, &report.credentials, &e);
                }
            }
        }
        summary.authorized = authorized.len();
        authorized
    }

    async fn renew(&self, authorized: Vec<AppAuths>, summary: &mut FlushSummary) {
        for app in authorized {
            match self
                .storage
                .renew_auths(
                    &app.service_id,
                    &app.credentials,
                    &app.auths,
                    self.config.auth_ttl,
                )
                .await
            {
                Ok(()) => summary.renewed += 1,
                Err(e) => {
                    summary.failed_renewals += 1;
                    self.error_handler
                        .handle_renew_error(&app.service_id, &app.credentials, &e);
                }
            }
        }
        metrics::counter!("flushd_auths_renewed_total").increment(summary.renewed as u64);
    }
}
