//! Crash-safe movement of usage data out of the shared store, and persistence of
//! authorizations.
//!
//! ## Flush protocol
//!
//! Gateways add the key of every report hash they touch to [`REPORT_KEYS_SET`].
//! A flush claims that set by renaming it to a set named after a timestamp
//! suffix, then renames each report hash to a `to_flush:` key carrying the same
//! suffix. Gateways keep accumulating into fresh hashes while the claimed ones
//! are read and deleted. Because the suffix is unique per claim, a failed or
//! half-finished claim is never overwritten by a later one and can be recovered
//! by hand.
//!
//! Renames and reads are done in batches of [`StorageConfig::batch_size`] keys so
//! no single command blocks the store for long.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::authorization::Authorization;
use crate::credentials::Credentials;
use crate::error::{Error, ErrorDetails};
use crate::kv_store::KeyValueStore;
use crate::storage_keys::{self, REPORT_KEYS_SET};

/// Usage of one application, per metric.
pub type Usage = BTreeMap<String, u64>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub service_id: String,
    pub credentials: Credentials,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum number of keys renamed, read or deleted in one store command.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cleanup_retries")]
    pub cleanup_retries: usize,
    #[serde(default = "default_cleanup_retry_delay", with = "duration_ms")]
    pub cleanup_retry_delay: Duration,
}

fn default_batch_size() -> usize {
    500
}

fn default_cleanup_retries() -> usize {
    3
}

fn default_cleanup_retry_delay() -> Duration {
    Duration::from_millis(100)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            cleanup_retries: default_cleanup_retries(),
            cleanup_retry_delay: default_cleanup_retry_delay(),
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub struct Storage {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        let config = StorageConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self { store, config }
    }

    /// Accumulate `reports` into their report hashes and mark them for the next flush.
    ///
    /// This is what gateways do on every hit; the flusher uses it to put back usage it
    /// could not deliver.
    pub async fn report(&self, reports: &[Report]) -> Result<(), Error> {
        for report in reports {
            let hash_key = storage_keys::report_hash_key(&report.service_id, &report.credentials);
            let fields: Vec<(String, i64)> = report
                .usage
                .iter()
                .map(|(metric, value)| (metric.clone(), i64::try_from(*value).unwrap_or(i64::MAX)))
                .collect();
            for batch in fields.chunks(self.config.batch_size) {
                self.store.hincrby_many(&hash_key, batch).await?;
            }
            self.store.sadd(REPORT_KEYS_SET, &hash_key).await?;
        }
        Ok(())
    }

    /// Claim every pending report and remove it from the store.
    ///
    /// Store failures never surface as errors: they are logged and the affected
    /// reports are left behind, either to be picked up again by a later flush or
    /// under a suffixed name for recovery.
    pub async fn reports_to_flush(&self) -> Vec<Report> {
        let suffix = suffix_for_time(Utc::now());

        let keys_to_flush = self.report_keys_to_flush(&suffix).await;
        if keys_to_flush.is_empty() {
            return Vec::new();
        }

        let (reports, read_keys) = self.read_reports(&keys_to_flush, &suffix).await;
        self.cleanup(&read_keys).await;
        reports
    }

    /// Write every authorization into the application's auth hash, then set a
    /// single TTL on the whole hash.
    pub async fn renew_auths(
        &self,
        service_id: &str,
        credentials: &Credentials,
        authorizations: &HashMap<String, Authorization>,
        ttl: Duration,
    ) -> Result<(), Error> {
        if authorizations.is_empty() {
            return Ok(());
        }
        let renew_error = |e: Error| {
            Error::new_without_logging(ErrorDetails::RenewAuth {
                service_id: service_id.to_string(),
                credentials: credentials.to_string(),
                message: e.to_string(),
            })
        };

        let hash_key = storage_keys::auth_hash_key(service_id, credentials);
        let fields: Vec<(String, String)> = authorizations
            .iter()
            .map(|(metric, auth)| (metric.clone(), auth.to_storage_value()))
            .collect();
        for batch in fields.chunks(self.config.batch_size) {
            self.store
                .hset_many(&hash_key, batch)
                .await
                .map_err(renew_error)?;
        }
        self.store
            .expire(&hash_key, ttl)
            .await
            .map_err(renew_error)
    }

    async fn report_keys_to_flush(&self, suffix: &str) -> Vec<String> {
        match self.store.scard(REPORT_KEYS_SET).await {
            Ok(0) => return Vec::new(),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to check for pending reports");
                return Vec::new();
            }
        }

        let flushing_set = storage_keys::flushing_report_keys_set(suffix);
        if let Err(e) = self.store.rename(REPORT_KEYS_SET, &flushing_set).await {
            error!(error = %e, "Failed to claim the set of pending report keys");
            return Vec::new();
        }

        let report_keys = match self.store.smembers(&flushing_set).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(
                    error = %e,
                    set = %flushing_set,
                    "Failed to read claimed report keys. The set is kept for recovery"
                );
                return Vec::new();
            }
        };
        if let Err(e) = self.delete_with_retries(std::slice::from_ref(&flushing_set)).await {
            error!(error = %e, set = %flushing_set, "Failed to delete claimed set of report keys");
        }

        let mut keys_to_flush = Vec::with_capacity(report_keys.len());
        for batch in report_keys.chunks(self.config.batch_size) {
            let pairs: Vec<(String, String)> = batch
                .iter()
                .map(|key| (key.clone(), storage_keys::name_key_to_flush(key, suffix)))
                .collect();
            match self.store.rename_many(&pairs).await {
                Ok(()) => keys_to_flush.extend(pairs.into_iter().map(|(_, to_flush)| to_flush)),
                Err(e) => warn!(
                    error = %e,
                    keys = batch.len(),
                    "Failed to claim some reports. Some reports are missing from this flush and will be sent later"
                ),
            }
        }
        keys_to_flush
    }

    /// Returns the reports read and every key whose read succeeded, empty or not.
    async fn read_reports(&self, keys_to_flush: &[String], suffix: &str) -> (Vec<Report>, Vec<String>) {
        let mut reports = Vec::with_capacity(keys_to_flush.len());
        let mut read_keys = Vec::with_capacity(keys_to_flush.len());

        for batch in keys_to_flush.chunks(self.config.batch_size) {
            let usages = match self.store.hgetall_many(batch).await {
                Ok(usages) => usages,
                Err(e) => {
                    error!(
                        error = %e,
                        keys = ?batch,
                        "Failed to read claimed reports. They are left in place for manual recovery"
                    );
                    continue;
                }
            };

            for (key, fields) in batch.iter().zip(usages) {
                read_keys.push(key.clone());
                if fields.is_empty() {
                    continue;
                }
                let Some((service_id, credentials)) = storage_keys::service_and_creds(key, suffix)
                else {
                    warn!(key = %key, "Skipping report with an unrecognized key");
                    continue;
                };
                reports.push(Report {
                    service_id,
                    credentials,
                    usage: parse_usage(key, fields),
                });
            }
        }

        (reports, read_keys)
    }

    async fn cleanup(&self, keys: &[String]) {
        for batch in keys.chunks(self.config.batch_size) {
            if let Err(e) = self.delete_with_retries(batch).await {
                error!(
                    error = %e,
                    keys = ?batch,
                    "Failed to delete flushed reports. They need to be removed by hand"
                );
            }
        }
    }

    async fn delete_with_retries(&self, keys: &[String]) -> Result<(), Error> {
        let store = &self.store;
        (|| async move { store.del(keys).await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.config.cleanup_retry_delay)
                    .with_max_times(self.config.cleanup_retries),
            )
            .sleep(tokio::time::sleep)
            .notify(|e: &Error, delay: Duration| {
                debug!(error = %e, ?delay, "Retrying delete");
            })
            .await
    }
}

fn suffix_for_time(now: DateTime<Utc>) -> String {
    format!("_{}", now.format("%Y%m%d%H%M%S%.3f"))
}

fn parse_usage(key: &str, fields: HashMap<String, String>) -> Usage {
    fields
        .into_iter()
        .filter_map(|(metric, value)| match value.parse::<u64>() {
            Ok(value) => Some((metric, value)),
            Err(e) => {
                warn!(key = %key, metric = %metric, value = %value, "Dropping invalid usage value: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    fn report(service_id: &str, user_key: &str, usage: &[(&str, u64)]) -> Report {
        Report {
            service_id: service_id.to_string(),
            credentials: Credentials::new([("user_key", user_key)]),
            usage: usage.iter().map(|(m, v)| (m.to_string(), *v)).collect(),
        }
    }

    fn storage(store: &Arc<MemoryStore>, batch_size: usize) -> Storage {
        Storage::new(
            store.clone(),
            StorageConfig {
                batch_size,
                cleanup_retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    fn sorted(mut reports: Vec<Report>) -> Vec<Report> {
        reports.sort_by(|a, b| {
            (a.service_id.as_str(), a.credentials.to_string())
                .cmp(&(b.service_id.as_str(), b.credentials.to_string()))
        });
        reports
    }

    #[test]
    fn test_suffix_for_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(suffix_for_time(now), "_20240102030405.000");
    }

    #[tokio::test]
    async fn test_report_accumulates() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        let r = report("s1", "uk1", &[("hits", 2), ("searches", 1)]);
        storage.report(&[r.clone()]).await.unwrap();
        storage.report(&[r]).await.unwrap();

        let hash = store.hash("report,service_id:s1,user_key:uk1");
        assert_eq!(hash.get("hits").map(String::as_str), Some("4"));
        assert_eq!(hash.get("searches").map(String::as_str), Some("2"));
        assert_eq!(
            store.set_members(REPORT_KEYS_SET),
            vec!["report,service_id:s1,user_key:uk1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_cache_does_not_rename() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        assert!(storage.reports_to_flush().await.is_empty());
        assert_eq!(store.command_count("RENAME"), 0);
    }

    #[tokio::test]
    async fn test_flush_returns_reports_and_leaves_no_keys() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 2);
        let expected = vec![
            report("s1", "uk1", &[("hits", 5)]),
            report("s1", "uk2", &[("hits", 1), ("searches", 3)]),
            report("s2", "uk1", &[("hits", 7)]),
        ];
        storage.report(&expected).await.unwrap();

        let reports = storage.reports_to_flush().await;
        assert_eq!(sorted(reports), sorted(expected));
        assert!(store.keys().is_empty(), "{:?}", store.keys());
        assert!(storage.reports_to_flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_set_without_hash_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        storage.report(&[report("s1", "uk1", &[("hits", 1)])]).await.unwrap();
        store
            .sadd(REPORT_KEYS_SET, "report,service_id:s1,user_key:gone")
            .await
            .unwrap();

        let reports = storage.reports_to_flush().await;
        assert_eq!(reports, vec![report("s1", "uk1", &[("hits", 1)])]);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_scard_failure_returns_empty() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        storage.report(&[report("s1", "uk1", &[("hits", 1)])]).await.unwrap();
        store.faults().fail_scard = true;

        assert!(storage.reports_to_flush().await.is_empty());
        assert!(logs_contain("Failed to check for pending reports"));
        assert_eq!(store.set_members(REPORT_KEYS_SET).len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_set_rename_failure_keeps_reports() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        storage.report(&[report("s1", "uk1", &[("hits", 1)])]).await.unwrap();
        store
            .faults()
            .failing_renames
            .insert(REPORT_KEYS_SET.to_string());

        assert!(storage.reports_to_flush().await.is_empty());
        assert!(logs_contain("ERROR"));
        assert_eq!(store.set_members(REPORT_KEYS_SET).len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_smembers_failure_keeps_flushing_set() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        storage.report(&[report("s1", "uk1", &[("hits", 1)])]).await.unwrap();
        store.faults().fail_smembers = true;

        assert!(storage.reports_to_flush().await.is_empty());
        assert!(logs_contain("kept for recovery"));
        let flushing_sets: Vec<String> = store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("flushing_report_keys_"))
            .collect();
        assert_eq!(flushing_sets.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_report_rename_failure_keeps_original_data() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 1);
        let ok = report("s1", "uk1", &[("hits", 1)]);
        let failing = report("s1", "uk2", &[("hits", 2)]);
        storage.report(&[ok.clone(), failing]).await.unwrap();
        let failing_key = "report,service_id:s1,user_key:uk2";
        store.faults().failing_renames.insert(failing_key.to_string());

        let reports = storage.reports_to_flush().await;
        assert_eq!(reports, vec![ok]);
        assert!(logs_contain("WARN"));
        assert!(logs_contain("Some reports are missing"));
        assert_eq!(
            store.hash(failing_key).get("hits").map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_failure_keeps_claimed_keys() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 1);
        let ok = report("s1", "uk1", &[("hits", 1)]);
        let failing = report("s1", "uk2", &[("hits", 2)]);
        storage.report(&[ok.clone(), failing]).await.unwrap();
        store
            .faults()
            .failing_reads
            .push("report,service_id:s1,user_key:uk2".to_string());

        let reports = storage.reports_to_flush().await;
        assert_eq!(reports, vec![ok]);
        assert!(logs_contain("ERROR"));
        assert!(logs_contain("left in place for manual recovery"));

        let left: Vec<String> = store.keys();
        assert_eq!(left.len(), 1);
        assert!(left[0].starts_with("to_flush:report,service_id:s1,user_key:uk2_"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_delete_failure_still_returns_reports() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        let r = report("s1", "uk1", &[("hits", 1)]);
        storage.report(&[r.clone()]).await.unwrap();
        store.faults().fail_deletes = usize::MAX;

        let reports = storage.reports_to_flush().await;
        assert_eq!(reports, vec![r]);
        assert!(logs_contain("Failed to delete flushed reports"));
    }

    #[tokio::test]
    async fn test_delete_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        storage.report(&[report("s1", "uk1", &[("hits", 1)])]).await.unwrap();
        // Absorbed by the retries of the first delete
        store.faults().fail_deletes = 3;

        assert_eq!(storage.reports_to_flush().await.len(), 1);
        assert!(store.keys().is_empty(), "{:?}", store.keys());
    }

    #[tokio::test]
    async fn test_renew_auths_sets_fields_and_one_ttl() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 1);
        let creds = Credentials::new([("app_id", "a1")]);
        let auths = HashMap::from([
            ("hits".to_string(), Authorization::allow()),
            ("searches".to_string(), Authorization::deny_over_limits()),
        ]);

        storage
            .renew_auths("s1", &creds, &auths, Duration::from_secs(60))
            .await
            .unwrap();

        let key = "auth,service_id:s1,app_id:a1";
        let hash = store.hash(key);
        assert_eq!(hash.get("hits").map(String::as_str), Some("1"));
        assert_eq!(
            hash.get("searches").map(String::as_str),
            Some("0:limits_exceeded")
        );
        assert_eq!(store.ttl(key), Some(Duration::from_secs(60)));
        assert_eq!(store.command_count("EXPIRE"), 1);
    }

    #[tokio::test]
    async fn test_renew_auths_failure_is_renew_error() {
        let store = Arc::new(MemoryStore::new());
        let storage = storage(&store, 500);
        store.faults().fail_writes = true;
        let auths = HashMap::from([("hits".to_string(), Authorization::allow())]);

        let err = storage
            .renew_auths("s1", &Credentials::new([("app_id", "a1")]), &auths, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::RenewAuth { .. }));
        assert!(err.is_transient());
    }
}
