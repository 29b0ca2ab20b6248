//! Resolves per-metric authorizations for one application.
//!
//! One `authorize` call returns the usage of every limited metric of the
//! application along with the metric hierarchy, which is enough to decide all
//! of them at once. Metrics without limits do not show up in that response, so
//! each requested one is checked with its own call predicting a single hit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::authorization::{Authorization, LIMITS_EXCEEDED_CODE};
use crate::backend::{AuthorizeResponse, UsageBackend, UsageReport};
use crate::credentials::Credentials;
use crate::error::Error;
use crate::storage::Usage;

/// Some backend versions only fill the message when the limits are exceeded.
const LIMITS_EXCEEDED_MESSAGE: &str = "usage limits are exceeded";

pub struct Authorizer {
    backend: Arc<dyn UsageBackend>,
}

impl Authorizer {
    pub fn new(backend: Arc<dyn UsageBackend>) -> Self {
        Self { backend }
    }

    /// Authorizations for `metrics` of the application.
    ///
    /// The result also holds every other limited metric of the application, since
    /// they come for free with the same backend call.
    pub async fn authorizations(
        &self,
        service_id: &str,
        credentials: &Credentials,
        metrics: &[String],
    ) -> Result<HashMap<String, Authorization>, Error> {
        let response = self.backend.authorize(service_id, credentials).await?;

        if !response.success && !denied_for_limits(&response) {
            let denied = Authorization::deny(response.error_code.clone());
            return Ok(metrics
                .iter()
                .map(|metric| (metric.clone(), denied.clone()))
                .collect());
        }

        let mut auths = limited_metrics_auths(&response);

        for metric in metrics {
            if auths.contains_key(metric) {
                continue;
            }
            let auth = self
                .unlimited_metric_auth(service_id, credentials, metric)
                .await?;
            auths.insert(metric.clone(), auth);
        }

        debug!(
            service_id,
            credentials = %credentials,
            metrics = auths.len(),
            "Resolved authorizations"
        );
        Ok(auths)
    }

    async fn unlimited_metric_auth(
        &self,
        service_id: &str,
        credentials: &Credentials,
        metric: &str,
    ) -> Result<Authorization, Error> {
        let predicted_usage = Usage::from([(metric.to_string(), 1)]);
        let response = self
            .backend
            .authorize_with_usage(service_id, credentials, &predicted_usage)
            .await?;
        if response.success {
            Ok(Authorization::allow())
        } else {
            Ok(Authorization::deny(response.error_code))
        }
    }
}

fn denied_for_limits(response: &AuthorizeResponse) -> bool {
    response.error_code.as_deref() == Some(LIMITS_EXCEEDED_CODE)
        || response.error_message.as_deref() == Some(LIMITS_EXCEEDED_MESSAGE)
}

/// Decides every metric with a usage report, parents first so their denial
/// reaches their children.
fn limited_metrics_auths(response: &AuthorizeResponse) -> HashMap<String, Authorization> {
    let usage_by_metric = group_by_metric(&response.usage_reports);

    let parents = response
        .hierarchy
        .keys()
        .filter_map(|parent| {
            usage_by_metric
                .iter()
                .find(|(metric, _)| *metric == parent.as_str())
        });
    let others = usage_by_metric
        .iter()
        .filter(|(metric, _)| !response.hierarchy.contains_key(*metric));

    let mut auths = HashMap::new();
    let mut decided = HashSet::new();
    for (metric, reports) in parents.chain(others) {
        if decided.contains(metric) {
            continue;
        }
        decided.insert(*metric);
        if reports.iter().all(|report| report.allows_next_hit()) {
            auths.insert(metric.to_string(), Authorization::allow());
            continue;
        }
        auths.insert(metric.to_string(), Authorization::deny_over_limits());
        for child in response.hierarchy.get(*metric).into_iter().flatten() {
            auths.insert(child.clone(), Authorization::deny_over_limits());
            decided.insert(child.as_str());
        }
    }
    auths
}

/// Groups usage reports by metric, keeping the order metrics first appear in.
fn group_by_metric(reports: &[UsageReport]) -> Vec<(&str, Vec<&UsageReport>)> {
    let mut grouped: Vec<(&str, Vec<&UsageReport>)> = Vec::new();
    for report in reports {
        match grouped.iter_mut().find(|(metric, _)| *metric == report.metric) {
            Some((_, metric_reports)) => metric_reports.push(report),
            None => grouped.push((report.metric.as_str(), vec![report])),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::error::ErrorDetails;
    use crate::testing::FakeBackend;

    fn usage(metric: &str, period: &str, current_value: u64, max_value: u64) -> UsageReport {
        UsageReport {
            metric: metric.to_string(),
            period: period.to_string(),
            current_value,
            max_value,
        }
    }

    fn metrics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn creds() -> Credentials {
        Credentials::new([("app_id", "a1"), ("app_key", "k1")])
    }

    fn authorizer(backend: FakeBackend) -> (Authorizer, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        (Authorizer::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_limits_within_bounds_are_allowed() {
        let response = AuthorizeResponse {
            success: true,
            usage_reports: vec![
                usage("hits", "minute", 9, 10),
                usage("hits", "day", 50, 100),
                usage("searches", "minute", 10, 10),
            ],
            ..Default::default()
        };
        let (authorizer, backend) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["hits"]))
            .await
            .unwrap();

        assert_eq!(auths["hits"], Authorization::allow());
        // Every limited metric is returned, not only the requested one
        assert_eq!(auths["searches"], Authorization::deny_over_limits());
        assert_eq!(auths.len(), 2);
        assert_eq!(backend.authorize_calls(), 1);
        assert_eq!(backend.authorize_with_usage_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denied_parent_denies_children() {
        let response = AuthorizeResponse {
            success: false,
            error_code: Some(LIMITS_EXCEEDED_CODE.to_string()),
            usage_reports: vec![
                usage("c1", "minute", 1, 10),
                usage("p", "minute", 11, 10),
                usage("c2", "minute", 0, 10),
            ],
            hierarchy: BTreeMap::from([("p".to_string(), metrics(&["c1", "c2"]))]),
            ..Default::default()
        };
        let (authorizer, _) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["c1"]))
            .await
            .unwrap();

        for metric in ["p", "c1", "c2"] {
            assert_eq!(auths[metric], Authorization::deny_over_limits(), "{metric}");
        }
    }

    #[tokio::test]
    async fn test_allowed_parent_leaves_children_to_their_own_limits() {
        let response = AuthorizeResponse {
            success: true,
            usage_reports: vec![usage("p", "minute", 1, 10), usage("c1", "minute", 5, 5)],
            hierarchy: BTreeMap::from([("p".to_string(), metrics(&["c1", "c2"]))]),
            ..Default::default()
        };
        let (authorizer, _) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["p"]))
            .await
            .unwrap();

        assert_eq!(auths["p"], Authorization::allow());
        assert_eq!(auths["c1"], Authorization::deny_over_limits());
        assert!(!auths.contains_key("c2"));
    }

    #[tokio::test]
    async fn test_limits_exceeded_detected_by_message() {
        let response = AuthorizeResponse {
            success: false,
            error_message: Some(LIMITS_EXCEEDED_MESSAGE.to_string()),
            usage_reports: vec![usage("hits", "minute", 3, 10)],
            ..Default::default()
        };
        let (authorizer, _) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["hits"]))
            .await
            .unwrap();
        assert_eq!(auths["hits"], Authorization::allow());
    }

    #[tokio::test]
    async fn test_denied_application_denies_every_requested_metric() {
        let response = AuthorizeResponse {
            success: false,
            error_code: Some("application_not_found".to_string()),
            usage_reports: vec![usage("hits", "minute", 0, 10)],
            ..Default::default()
        };
        let (authorizer, backend) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["hits", "searches"]))
            .await
            .unwrap();

        let denied = Authorization::deny(Some("application_not_found".to_string()));
        assert_eq!(auths.len(), 2);
        assert_eq!(auths["hits"], denied);
        assert_eq!(auths["searches"], denied);
        assert_eq!(backend.authorize_with_usage_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unlimited_metrics_use_predicted_usage() {
        let backend = FakeBackend::new().with_response(
            "s1",
            AuthorizeResponse {
                success: true,
                usage_reports: vec![usage("hits", "minute", 0, 10)],
                ..Default::default()
            },
        );
        backend.predicted_responses.lock().unwrap().insert(
            "uploads".to_string(),
            AuthorizeResponse {
                success: false,
                error_code: Some("metric_invalid".to_string()),
                ..Default::default()
            },
        );
        let (authorizer, backend) = authorizer(backend);

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["hits", "searches", "uploads"]))
            .await
            .unwrap();

        assert_eq!(auths["hits"], Authorization::allow());
        assert_eq!(auths["searches"], Authorization::allow());
        assert_eq!(
            auths["uploads"],
            Authorization::deny(Some("metric_invalid".to_string()))
        );
        assert_eq!(backend.authorize_with_usage_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_child_denied_by_parent_is_not_checked_again() {
        let response = AuthorizeResponse {
            success: false,
            error_code: Some(LIMITS_EXCEEDED_CODE.to_string()),
            usage_reports: vec![usage("p", "minute", 10, 10)],
            hierarchy: BTreeMap::from([("p".to_string(), metrics(&["c1"]))]),
            ..Default::default()
        };
        let (authorizer, backend) = authorizer(FakeBackend::new().with_response("s1", response));

        let auths = authorizer
            .authorizations("s1", &creds(), &metrics(&["c1"]))
            .await
            .unwrap();

        assert_eq!(auths["c1"], Authorization::deny_over_limits());
        assert_eq!(backend.authorize_with_usage_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_an_error() {
        let backend = FakeBackend::new();
        backend.fail_service(
            "s1",
            ErrorDetails::BackendUnavailable {
                message: "timeout".to_string(),
            },
        );
        let (authorizer, _) = authorizer(backend);

        let err = authorizer
            .authorizations("s1", &creds(), &metrics(&["hits"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BackendUnavailable { .. }
        ));
    }
}
