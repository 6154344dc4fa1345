//! Error taxonomy and the result type handed back to hosts.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use avaconf::ConfigError;
use avaproto::{AddressError, WireError};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket bind/send/receive failures.
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad input from a caller: address, slot, parameters, config.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Malformed data from the remote application or discovery service.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Refused by a rate limit, cooldown or permission rule.
    #[error("{message}")]
    Policy {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Operation not valid in the current lifecycle state.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl BridgeError {
    pub fn policy(message: impl Into<String>) -> Self {
        BridgeError::Policy {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn cooldown(message: impl Into<String>, retry_after_secs: u64) -> Self {
        BridgeError::Policy {
            message: message.into(),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BridgeError::Policy {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidAddress(e) => BridgeError::Validation(e.to_string()),
            other => BridgeError::Protocol(other.to_string()),
        }
    }
}

impl From<AddressError> for BridgeError {
    fn from(err: AddressError) -> Self {
        BridgeError::Validation(err.to_string())
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BridgeError::Protocol(err.to_string())
        } else {
            BridgeError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Outcome of every host-facing operation. Never an error type: failures are
/// reported with `success = false` and a short human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

impl From<BridgeError> for ActionResult {
    fn from(err: BridgeError) -> Self {
        Self {
            success: false,
            retry_after_secs: err.retry_after_secs(),
            message: err.to_string(),
        }
    }
}

impl From<Result<String>> for ActionResult {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(message) => ActionResult::ok(message),
            Err(e) => e.into(),
        }
    }
}

impl IntoResponse for ActionResult {
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else if self.retry_after_secs.is_some() {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_carries_retry_after() {
        let result: ActionResult = BridgeError::cooldown("Avatar switch on cooldown", 42).into();
        assert!(!result.success);
        assert_eq!(result.retry_after_secs, Some(42));
        assert_eq!(result.message, "Avatar switch on cooldown");
    }

    #[test]
    fn invalid_address_is_a_validation_error() {
        let err: BridgeError = WireError::InvalidAddress(AddressError::Empty).into();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[test]
    fn result_json_is_camel_case() {
        let json = serde_json::to_value(ActionResult {
            success: false,
            message: "slow down".into(),
            retry_after_secs: Some(3),
        })
        .unwrap();
        assert_eq!(json["retryAfterSecs"], 3);
        let ok = serde_json::to_value(ActionResult::ok("done")).unwrap();
        assert!(ok.get("retryAfterSecs").is_none());
    }
}
