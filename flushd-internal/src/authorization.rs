use std::str::FromStr;

use crate::error::{Error, ErrorDetails};

/// Reason used when an application is denied because it went over its limits.
pub const LIMITS_EXCEEDED_CODE: &str = "limits_exceeded";

/// The cached answer for a single (service, credentials, metric) triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    allowed: bool,
    reason: Option<String>,
}

impl Authorization {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny_over_limits() -> Self {
        Self::deny(Some(LIMITS_EXCEEDED_CODE.to_string()))
    }

    pub fn deny(reason: Option<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.filter(|r| !r.is_empty()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_limits_exceeded(&self) -> bool {
        !self.allowed && self.reason.as_deref() == Some(LIMITS_EXCEEDED_CODE)
    }

    /// `"1"` when allowed, `"0"` when denied without a reason, `"0:<reason>"` otherwise.
    pub fn to_storage_value(&self) -> String {
        match (self.allowed, &self.reason) {
            (true, _) => "1".to_string(),
            (false, None) => "0".to_string(),
            (false, Some(reason)) => format!("0:{reason}"),
        }
    }
}

impl FromStr for Authorization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "1" => Ok(Self::allow()),
            None if s == "0" => Ok(Self::deny(None)),
            Some(("0", reason)) => Ok(Self::deny(Some(reason.to_string()))),
            _ => Err(Error::new_without_logging(ErrorDetails::InternalError {
                message: format!("Invalid stored authorization `{s}`"),
            })),
        }
    }
}
