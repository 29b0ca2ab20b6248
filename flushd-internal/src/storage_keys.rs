//! Names of every key, set and channel shared with the gateway.
//!
//! Values embedded in a name (service ids, credential fields, metrics) are
//! escaped with [`escape`], so a name can always be split back into its parts
//! on unescaped `,` separators.

use crate::credentials::{escape, split_unescaped, unescape, Credentials};
use crate::error::{Error, ErrorDetails};

pub const AUTH_REQUESTS_CHANNEL: &str = "xc_channel_auth_requests";
pub const AUTH_RESPONSES_CHANNEL_PREFIX: &str = "xc_channel_auth_response:";

pub const REPORT_KEYS_SET: &str = "report_keys";
const FLUSHING_REPORT_KEYS_SET_PREFIX: &str = "flushing_report_keys";
const KEY_TO_FLUSH_PREFIX: &str = "to_flush:";

const AUTH_KEY_TYPE: &str = "auth";
const REPORT_KEY_TYPE: &str = "report";

const SERVICE_ID_PREFIX: &str = "service_id:";
const METRIC_PREFIX: &str = "metric:";

/// Hash holding one cached authorization per metric for an application.
pub fn auth_hash_key(service_id: &str, credentials: &Credentials) -> String {
    hash_key(AUTH_KEY_TYPE, service_id, credentials)
}

/// Hash holding the pending hit counters per metric for an application.
pub fn report_hash_key(service_id: &str, credentials: &Credentials) -> String {
    hash_key(REPORT_KEY_TYPE, service_id, credentials)
}

fn hash_key(key_type: &str, service_id: &str, credentials: &Credentials) -> String {
    format!(
        "{key_type},{SERVICE_ID_PREFIX}{},{}",
        escape(service_id),
        credentials.to_sorted_escaped_string()
    )
}

pub fn flushing_report_keys_set(suffix: &str) -> String {
    format!("{FLUSHING_REPORT_KEYS_SET_PREFIX}{suffix}")
}

pub fn name_key_to_flush(report_key: &str, suffix: &str) -> String {
    format!("{KEY_TO_FLUSH_PREFIX}{report_key}{suffix}")
}

/// Recover the service id and credentials a to-flush key was built from.
pub fn service_and_creds(key_to_flush: &str, suffix: &str) -> Option<(String, Credentials)> {
    let report_key = key_to_flush
        .strip_prefix(KEY_TO_FLUSH_PREFIX)?
        .strip_suffix(suffix)?;
    let rest = report_key
        .strip_prefix(REPORT_KEY_TYPE)?
        .strip_prefix(',')?;
    let parts = split_unescaped(rest, ',');
    let (service_part, cred_parts) = parts.split_first()?;
    let service_id = unescape(service_part.strip_prefix(SERVICE_ID_PREFIX)?);
    let credentials = Credentials::from_escaped(&cred_parts.join(","));
    Some((service_id, credentials))
}

/// A decoded priority authorization request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub service_id: String,
    pub credentials: Credentials,
    pub metric: String,
}

impl AuthRequest {
    /// `service_id:<id>,<credentials>,metric:<name>`, as published on [`AUTH_REQUESTS_CHANNEL`].
    pub fn to_message(&self) -> String {
        let creds = self.credentials.to_sorted_escaped_string();
        let service_id = escape(&self.service_id);
        let metric = escape(&self.metric);
        if creds.is_empty() {
            format!("{SERVICE_ID_PREFIX}{service_id},{METRIC_PREFIX}{metric}")
        } else {
            format!("{SERVICE_ID_PREFIX}{service_id},{creds},{METRIC_PREFIX}{metric}")
        }
    }

    /// Channel the gateway listens on for the answer to this request.
    pub fn response_channel(&self) -> String {
        format!("{AUTH_RESPONSES_CHANNEL_PREFIX}{}", self.to_message())
    }
}

pub fn parse_auth_request(msg: &str) -> Result<AuthRequest, Error> {
    let invalid = |message: &str| {
        Error::new_without_logging(ErrorDetails::InvalidRequestMessage {
            raw: msg.to_string(),
            message: message.to_string(),
        })
    };

    let parts = split_unescaped(msg, ',');
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| invalid("empty message"))?;
    let (last, cred_parts) = rest
        .split_last()
        .ok_or_else(|| invalid("expected service id, credentials and metric"))?;

    let service_id = first
        .strip_prefix(SERVICE_ID_PREFIX)
        .ok_or_else(|| invalid("missing service id"))?;
    let metric = last
        .strip_prefix(METRIC_PREFIX)
        .ok_or_else(|| invalid("missing metric"))?;
    if service_id.is_empty() || metric.is_empty() {
        return Err(invalid("service id and metric must not be empty"));
    }

    let creds = cred_parts.join(",");
    let creds = creds.strip_prefix("credentials:").unwrap_or(&creds);

    Ok(AuthRequest {
        service_id: unescape(service_id),
        credentials: Credentials::from_escaped(creds),
        metric: unescape(metric),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new([("app_id", "a,1"), ("app_key", "k:1")])
    }

    #[test]
    fn test_hash_keys() {
        let c = Credentials::new([("user_key", "uk1")]);
        assert_eq!(auth_hash_key("s1", &c), "auth,service_id:s1,user_key:uk1");
        assert_eq!(report_hash_key("s1", &c), "report,service_id:s1,user_key:uk1");
    }

    #[test]
    fn test_service_and_creds_from_key_to_flush() {
        let suffix = "_20240101120000.123";
        let key = name_key_to_flush(&report_hash_key("s:1", &creds()), suffix);
        assert!(key.starts_with("to_flush:report,service_id:s\\:1,"));

        let (service_id, credentials) = service_and_creds(&key, suffix).unwrap();
        assert_eq!(service_id, "s:1");
        assert_eq!(credentials, creds());
    }

    #[test]
    fn test_service_and_creds_rejects_other_suffix() {
        let key = name_key_to_flush(&report_hash_key("s1", &creds()), "_1");
        assert!(service_and_creds(&key, "_2").is_none());
    }

    #[test]
    fn test_parse_auth_request() {
        let msg = "service_id:s1,app_id:a\\,1,app_key:k\\:1,metric:hits";
        let request = parse_auth_request(msg).unwrap();
        assert_eq!(request.service_id, "s1");
        assert_eq!(request.credentials, creds());
        assert_eq!(request.metric, "hits");
        assert_eq!(request.to_message(), msg);
        assert_eq!(
            request.response_channel(),
            format!("xc_channel_auth_response:{msg}")
        );
    }

    #[test]
    fn test_parse_auth_request_with_credentials_prefix() {
        let request =
            parse_auth_request("service_id:s1,credentials:user_key:uk1,metric:hits").unwrap();
        assert_eq!(request.credentials, Credentials::new([("user_key", "uk1")]));
    }

    #[test]
    fn test_parse_invalid_auth_request() {
        for msg in ["", "service_id:s1", "app_id:a,metric:hits", "service_id:s1,app_id:a"] {
            let err = parse_auth_request(msg).unwrap_err();
            assert!(
                matches!(err.get_details(), ErrorDetails::InvalidRequestMessage { .. }),
                "{msg}"
            );
        }
    }
}
