use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AuthorizeResponse, UsageBackend};
use crate::credentials::Credentials;
use crate::error::{Error, ErrorDetails};
use crate::storage::Usage;

const AUTHORIZE_PATH: &str = "transactions/authorize.json";
const REPORT_PATH: &str = "transactions.json";

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: Url,
    pub provider_key: SecretString,
    pub timeout: Duration,
}

/// JSON client for the usage backend's transaction API.
pub struct HttpUsageBackend {
    client: Client,
    base_url: Url,
    provider_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    provider_key: &'a str,
    service_id: &'a str,
    transactions: [Transaction<'a>; 1],
}

#[derive(Serialize)]
struct Transaction<'a> {
    #[serde(flatten)]
    credentials: &'a Credentials,
    usage: &'a Usage,
}

impl HttpUsageBackend {
    pub fn new(config: BackendConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to build HTTP client: {e}"),
                })
            })?;
        let mut base_url = config.url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            provider_key: config.provider_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid backend URL {}: {e}", self.base_url),
            })
        })
    }

    async fn send_authorize(
        &self,
        service_id: &str,
        credentials: &Credentials,
        predicted_usage: Option<&Usage>,
    ) -> Result<AuthorizeResponse, Error> {
        let mut query: Vec<(String, String)> = vec![
            (
                "provider_key".to_string(),
                self.provider_key.expose_secret().to_string(),
            ),
            ("service_id".to_string(), service_id.to_string()),
            ("hierarchy".to_string(), "1".to_string()),
        ];
        query.extend(
            credentials
                .iter()
                .map(|(field, value)| (field.to_string(), value.to_string())),
        );
        if let Some(usage) = predicted_usage {
            query.extend(
                usage
                    .iter()
                    .map(|(metric, value)| (format!("usage[{metric}]"), value.to_string())),
            );
        }

        let res = self
            .client
            .get(self.endpoint(AUTHORIZE_PATH)?)
            .query(&query)
            .send()
            .await
            .map_err(handle_reqwest_error)?;

        let status = res.status();
        let raw_response = res.text().await.map_err(handle_reqwest_error)?;
        if status.is_success() || status == StatusCode::CONFLICT {
            return parse_authorize_response(&raw_response);
        }
        // Denied applications come back as 403/404 with an error body
        if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
            if let Ok(response) = parse_authorize_response(&raw_response) {
                return Ok(response);
            }
            if let Ok(body) = serde_json::from_str::<ErrorBody>(&raw_response) {
                return Ok(AuthorizeResponse {
                    success: false,
                    error_code: body.error.code,
                    error_message: body.error.message,
                    ..Default::default()
                });
            }
        }
        Err(status_error(status, &raw_response))
    }
}

#[async_trait]
impl UsageBackend for HttpUsageBackend {
    async fn authorize(
        &self,
        service_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthorizeResponse, Error> {
        self.send_authorize(service_id, credentials, None).await
    }

    async fn authorize_with_usage(
        &self,
        service_id: &str,
        credentials: &Credentials,
        predicted_usage: &Usage,
    ) -> Result<AuthorizeResponse, Error> {
        self.send_authorize(service_id, credentials, Some(predicted_usage))
            .await
    }

    async fn report(
        &self,
        service_id: &str,
        credentials: &Credentials,
        usage: &Usage,
    ) -> Result<(), Error> {
        let request_body = ReportRequest {
            provider_key: self.provider_key.expose_secret(),
            service_id,
            transactions: [Transaction { credentials, usage }],
        };
        let res = self
            .client
            .post(self.endpoint(REPORT_PATH)?)
            .json(&request_body)
            .send()
            .await
            .map_err(handle_reqwest_error)?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let raw_response = res.text().await.map_err(handle_reqwest_error)?;
        Err(status_error(status, &raw_response))
    }
}

fn parse_authorize_response(raw_response: &str) -> Result<AuthorizeResponse, Error> {
    serde_json::from_str(raw_response).map_err(|e| {
        Error::new_without_logging(ErrorDetails::BackendResponse {
            message: format!("{e}: {raw_response}"),
        })
    })
}

fn handle_reqwest_error(e: reqwest::Error) -> Error {
    Error::new_without_logging(ErrorDetails::BackendUnavailable {
        message: e.to_string(),
    })
}

fn status_error(status: StatusCode, raw_response: &str) -> Error {
    let payload = serde_json::from_str::<ErrorBody>(raw_response)
        .map(|body| body.error)
        .ok();
    let message = payload
        .as_ref()
        .and_then(|p| p.message.clone())
        .unwrap_or_else(|| raw_response.to_string());

    let details = match status {
        s if s.is_server_error() => ErrorDetails::BackendUnavailable {
            message: format!("status {s}: {message}"),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ErrorDetails::BackendBadRequest {
                status: status.as_u16(),
                message,
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            ErrorDetails::BackendAuth {
                code: payload.and_then(|p| p.code),
                message,
            }
        }
        s => ErrorDetails::BackendResponse {
            message: format!("unexpected status {s}: {message}"),
        },
    };
    Error::new_without_logging(details)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorded {
        queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/backend")).unwrap()
    }

    fn backend(url: Url) -> HttpUsageBackend {
        HttpUsageBackend::new(BackendConfig {
            url,
            provider_key: SecretString::from("pk".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn router(status: AxumStatus, body: Value, recorded: Recorded) -> Router {
        let authorize_body = body.clone();
        Router::new()
            .route(
                "/backend/transactions/authorize.json",
                get(
                    move |State(recorded): State<Recorded>,
                          Query(query): Query<HashMap<String, String>>| async move {
                        recorded.queries.lock().unwrap().push(query);
                        (status, Json(authorize_body))
                    },
                ),
            )
            .route(
                "/backend/transactions.json",
                post(
                    move |State(recorded): State<Recorded>, Json(request): Json<Value>| async move {
                        recorded.bodies.lock().unwrap().push(request);
                        (status, Json(body))
                    },
                ),
            )
            .with_state(recorded)
    }

    #[tokio::test]
    async fn test_authorize_sends_credentials_and_parses_response() {
        let recorded = Recorded::default();
        let body = json!({
            "success": true,
            "usage_reports": [
                {"metric": "hits", "period": "minute", "current_value": 3, "max_value": 10}
            ],
            "hierarchy": {"hits": ["search"]}
        });
        let url = serve(router(AxumStatus::OK, body, recorded.clone())).await;
        let creds = Credentials::new([("app_id", "a1"), ("app_key", "k1")]);
        let predicted = Usage::from([("hits".to_string(), 1)]);

        let response = backend(url)
            .authorize_with_usage("s1", &creds, &predicted)
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.usage_reports.len(), 1);
        assert_eq!(response.hierarchy["hits"], vec!["search".to_string()]);

        let queries = recorded.queries.lock().unwrap();
        let query = &queries[0];
        assert_eq!(query["provider_key"], "pk");
        assert_eq!(query["service_id"], "s1");
        assert_eq!(query["app_id"], "a1");
        assert_eq!(query["app_key"], "k1");
        assert_eq!(query["usage[hits]"], "1");
    }

    #[tokio::test]
    async fn test_authorize_denied_is_not_an_error() {
        let body = json!({"error": {"code": "application_not_found", "message": "not found"}});
        let url = serve(router(AxumStatus::NOT_FOUND, body, Recorded::default())).await;

        let response = backend(url)
            .authorize("s1", &Credentials::new([("app_id", "a1")]))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.error_code.as_deref(), Some("application_not_found"));
    }

    #[tokio::test]
    async fn test_authorize_server_error_is_unavailable() {
        let url = serve(router(
            AxumStatus::SERVICE_UNAVAILABLE,
            json!({}),
            Recorded::default(),
        ))
        .await;

        let err = backend(url)
            .authorize("s1", &Credentials::new([("app_id", "a1")]))
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::BackendUnavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_report_sends_transaction() {
        let recorded = Recorded::default();
        let url = serve(router(AxumStatus::ACCEPTED, json!({}), recorded.clone())).await;
        let usage = Usage::from([("hits".to_string(), 5)]);

        backend(url)
            .report("s1", &Credentials::new([("user_key", "uk1")]), &usage)
            .await
            .unwrap();

        let bodies = recorded.bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            json!({
                "provider_key": "pk",
                "service_id": "s1",
                "transactions": [{"user_key": "uk1", "usage": {"hits": 5}}]
            })
        );
    }

    #[tokio::test]
    async fn test_report_error_statuses() {
        let body = json!({"error": {"code": "provider_key_invalid", "message": "invalid key"}});
        let url = serve(router(AxumStatus::FORBIDDEN, body, Recorded::default())).await;
        let usage = Usage::from([("hits".to_string(), 1)]);
        let creds = Credentials::new([("user_key", "uk1")]);

        let err = backend(url).report("s1", &creds, &usage).await.unwrap_err();
        assert_eq!(
            err.get_details(),
            &ErrorDetails::BackendAuth {
                code: Some("provider_key_invalid".to_string()),
                message: "invalid key".to_string(),
            }
        );

        let url = serve(router(
            AxumStatus::UNPROCESSABLE_ENTITY,
            json!({"error": {"message": "usage must be a number"}}),
            Recorded::default(),
        ))
        .await;
        let err = backend(url).report("s1", &creds, &usage).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BackendBadRequest { status: 422, .. }
        ));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/")).unwrap();

        let err = backend(url)
            .report(
                "s1",
                &Credentials::new([("user_key", "uk1")]),
                &Usage::from([("hits".to_string(), 1)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::BackendUnavailable { .. }));
    }
}
