use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::error::Error;
use crate::storage::Usage;

pub mod http;

/// Usage of one limited metric during one limit period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub metric: String,
    pub period: String,
    pub current_value: u64,
    pub max_value: u64,
}

impl UsageReport {
    /// Whether one more hit fits in this period. Being exactly at the limit still allows it.
    pub fn allows_next_hit(&self) -> bool {
        self.current_value.saturating_add(1) <= self.max_value
    }
}

/// Parent metric -> children. Only parents that carry a limit are listed.
pub type MetricHierarchy = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage_reports: Vec<UsageReport>,
    #[serde(default)]
    pub hierarchy: MetricHierarchy,
}

/// The remote service that keeps the authoritative usage and limits.
///
/// Implementations report transport and server failures as
/// [`crate::error::ErrorDetails::BackendUnavailable`]. An application being denied is
/// not an error: it is an `Ok` response with `success == false`.
#[async_trait]
pub trait UsageBackend: Send + Sync {
    /// Current status of the application, without counting any usage.
    async fn authorize(
        &self,
        service_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthorizeResponse, Error>;

    /// Whether the application can still send `predicted_usage`.
    async fn authorize_with_usage(
        &self,
        service_id: &str,
        credentials: &Credentials,
        predicted_usage: &Usage,
    ) -> Result<AuthorizeResponse, Error>;

    async fn report(
        &self,
        service_id: &str,
        credentials: &Credentials,
        usage: &Usage,
    ) -> Result<(), Error>;
}
