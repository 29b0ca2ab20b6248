//! Bounded pool of async tasks.
//!
//! ## Design
//!
//! Tasks are spawned on the tokio runtime right away but wait for one of
//! `max_workers` semaphore permits before running, so at most `max_workers` of
//! them make progress at once. A [`TaskTracker`] keeps count of everything
//! submitted, which lets [`WorkerPool::shutdown`] drain the pool.
//!
//! ## Shutdown
//!
//! Closing the pool refuses new submissions. Tasks already submitted keep
//! running until the grace period expires; anything still running or queued
//! after that is cancelled through a [`CancellationToken`] and resolves to `None`.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{Error, ErrorDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: default_max_workers(),
        }
    }
}

/// Parses `min:max`, or just `max`.
impl FromStr for PoolConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid worker range `{s}`: {message}"),
            })
        };
        let parse = |n: &str| {
            n.trim()
                .parse::<usize>()
                .map_err(|e| invalid(format!("`{n}` is not a number: {e}")))
        };

        let (min_workers, max_workers) = match s.split_once(':') {
            Some((min, max)) => (parse(min)?, parse(max)?),
            None => (0, parse(s)?),
        };
        if max_workers == 0 {
            return Err(invalid("the maximum must be at least 1".to_string()));
        }
        if min_workers > max_workers {
            return Err(invalid(
                "the minimum cannot be greater than the maximum".to_string(),
            ));
        }
        Ok(Self {
            min_workers,
            max_workers,
        })
    }
}

pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let name = name.into();
        let max_workers = config.max_workers.max(1);
        info!(
            pool = %name,
            min_workers = config.min_workers,
            max_workers,
            "Created worker pool"
        );
        Self {
            name,
            permits: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Number of submitted tasks that have not finished yet.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Queue `task`. It resolves to `None` if it was cancelled during shutdown.
    pub fn submit<F, T>(&self, task: F) -> Result<JoinHandle<Option<T>>, Error>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(Error::new_without_logging(ErrorDetails::WorkerPoolClosed {
                pool: self.name.clone(),
            }));
        }
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        Ok(self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => None,
                output = async move {
                    let _permit = permits.acquire_owned().await.ok()?;
                    Some(task.await)
                } => output,
            }
        }))
    }

    /// Submit every task and wait for all of them, returning results in submission order.
    pub async fn scatter_gather<T, F>(&self, tasks: impl IntoIterator<Item = F>) -> Vec<Result<T, Error>>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let pending = tasks.into_iter().map(|task| {
            let submitted = self.submit(task);
            let pool = self.name.clone();
            async move {
                match submitted?.await {
                    Ok(Some(result)) => result,
                    Ok(None) => Err(Error::new_without_logging(ErrorDetails::TaskCancelled {
                        pool,
                    })),
                    Err(e) => Err(Error::new_without_logging(ErrorDetails::InternalError {
                        message: format!("Task in worker pool `{pool}` failed: {e}"),
                    })),
                }
            }
        });
        join_all(pending).await
    }

    /// Stop accepting work.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Close the pool and wait for submitted tasks, cancelling whatever is left
    /// once `grace` has elapsed.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                pool = %self.name,
                remaining = self.tracker.len(),
                "Cancelling tasks still running after the shutdown grace period"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }
        info!(pool = %self.name, "Worker pool shut down");
    }
}
