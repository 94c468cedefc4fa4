//! # Error Handling
//!
//! Two error families live here:
//! - **AppError**: failures of the small HTTP surface (health, metrics, config),
//!   converted into JSON responses by actix-web.
//! - **RelayError**: everything that can end a relay session. Each variant knows
//!   which close frame, if any, the browser should observe.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Enums for error types**: each variant is one failure scenario
//! - **From trait**: lets `?` convert library errors automatically
//! - **ResponseError trait**: turns an error into an HTTP response

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Close reason sent when no credential is configured.
pub const MISSING_CREDENTIAL_REASON: &str = "Missing API Key";
/// Close reason sent to the browser when the upstream side fails.
pub const UPSTREAM_FAILURE_REASON: &str = "Upstream API Error";
/// Close reason sent upstream when the browser side fails.
pub const CLIENT_FAILURE_REASON: &str = "Client Error";
pub const HANDSHAKE_TIMEOUT_REASON: &str = "Upstream Handshake Timeout";
pub const QUEUE_OVERFLOW_REASON: &str = "Message Queue Overflow";
pub const INTERNAL_FAILURE_REASON: &str = "Relay Internal Error";

/// Custom error types for the HTTP endpoints.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    NotFound(String),
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "No route for GET /nope",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Reasons a relay session ends abnormally.
///
/// No variant is retried: each one terminates its own session and nothing
/// else.
#[derive(Debug)]
pub enum RelayError {
    /// The request was not a relayable upgrade; the socket is dropped.
    RejectedUpgrade(String),
    /// No credential is configured, so no session may be relayed.
    MissingCredential,
    /// The outbound handshake failed.
    UpstreamConnect(String),
    /// The outbound handshake did not finish in time.
    UpstreamTimeout(Duration),
    /// The outbound connection errored after it was open.
    UpstreamRuntime(String),
    /// The inbound connection errored.
    ClientRuntime(String),
    /// Too much was queued before the outbound side opened.
    QueueOverflow { messages: usize, bytes: usize },
    /// The relay broke one of its own invariants.
    Internal(String),
}

impl RelayError {
    /// The close frame the browser receives because of this error.
    ///
    /// `None` means the browser gets no close frame: either the socket is
    /// dropped outright, or the browser itself is the side that failed.
    pub fn inbound_close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            RelayError::RejectedUpgrade(_) | RelayError::ClientRuntime(_) => return None,
            RelayError::MissingCredential => (CloseCode::Policy, MISSING_CREDENTIAL_REASON),
            RelayError::UpstreamConnect(_) | RelayError::UpstreamRuntime(_) => {
                (CloseCode::Error, UPSTREAM_FAILURE_REASON)
            }
            RelayError::UpstreamTimeout(_) => (CloseCode::Error, HANDSHAKE_TIMEOUT_REASON),
            RelayError::QueueOverflow { .. } => (CloseCode::Size, QUEUE_OVERFLOW_REASON),
            RelayError::Internal(_) => (CloseCode::Error, INTERNAL_FAILURE_REASON),
        };
        Some(close_frame(code, reason))
    }

    /// The close frame the upstream receives because of this error, if any.
    pub fn outbound_close_frame(&self) -> Option<CloseFrame<'static>> {
        match self {
            RelayError::ClientRuntime(_) => Some(close_frame(CloseCode::Error, CLIENT_FAILURE_REASON)),
            RelayError::Internal(_) => Some(close_frame(CloseCode::Error, INTERNAL_FAILURE_REASON)),
            _ => None,
        }
    }

    /// Short machine-readable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::RejectedUpgrade(_) => "rejected_upgrade",
            RelayError::MissingCredential => "missing_credential",
            RelayError::UpstreamConnect(_) => "upstream_connect",
            RelayError::UpstreamTimeout(_) => "upstream_timeout",
            RelayError::UpstreamRuntime(_) => "upstream_runtime",
            RelayError::ClientRuntime(_) => "client_runtime",
            RelayError::QueueOverflow { .. } => "queue_overflow",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::RejectedUpgrade(why) => write!(f, "Rejected upgrade: {}", why),
            RelayError::MissingCredential => write!(f, "No upstream credential configured"),
            RelayError::UpstreamConnect(msg) => write!(f, "Upstream connect failed: {}", msg),
            RelayError::UpstreamTimeout(after) => {
                write!(f, "Upstream handshake timed out after {}ms", after.as_millis())
            }
            RelayError::UpstreamRuntime(msg) => write!(f, "Upstream connection error: {}", msg),
            RelayError::ClientRuntime(msg) => write!(f, "Client connection error: {}", msg),
            RelayError::QueueOverflow { messages, bytes } => write!(
                f,
                "Outbound queue overflow ({} messages, {} bytes)",
                messages, bytes
            ),
            RelayError::Internal(msg) => write!(f, "Relay internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::UpstreamConnect(format!("invalid upstream url: {}", err))
    }
}

pub fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_closes_with_policy_code() {
        let frame = RelayError::MissingCredential.inbound_close_frame().unwrap();
        assert_eq!(u16::from(frame.code), 1008);
        assert_eq!(frame.reason, "Missing API Key");
    }

    #[test]
    fn test_client_failure_only_reaches_upstream() {
        let err = RelayError::ClientRuntime("reset".to_string());
        assert!(err.inbound_close_frame().is_none());

        let frame = err.outbound_close_frame().unwrap();
        assert_eq!(u16::from(frame.code), 1011);
        assert_eq!(frame.reason, "Client Error");
    }

    #[test]
    fn test_upstream_failures_share_a_synthetic_code() {
        for err in [
            RelayError::UpstreamConnect("refused".to_string()),
            RelayError::UpstreamRuntime("reset".to_string()),
        ] {
            let frame = err.inbound_close_frame().unwrap();
            assert_eq!(u16::from(frame.code), 1011);
            assert_eq!(frame.reason, UPSTREAM_FAILURE_REASON);
            assert!(err.outbound_close_frame().is_none());
        }
    }

    #[test]
    fn test_rejected_upgrade_has_no_close_frame() {
        let err = RelayError::RejectedUpgrade("no marker".to_string());
        assert!(err.inbound_close_frame().is_none());
        assert!(err.outbound_close_frame().is_none());
    }

    #[test]
    fn test_internal_error_closes_both_sides() {
        let err = RelayError::Internal("queue reused".to_string());
        assert_eq!(err.kind(), "internal");
        for frame in [err.inbound_close_frame(), err.outbound_close_frame()] {
            let frame = frame.unwrap();
            assert_eq!(u16::from(frame.code), 1011);
            assert_eq!(frame.reason, INTERNAL_FAILURE_REASON);
        }
    }

    #[test]
    fn test_bad_url_is_a_connect_error() {
        let err = RelayError::from(url::Url::parse("not a url").unwrap_err());
        assert_eq!(err.kind(), "upstream_connect");
    }

    #[test]
    fn test_app_error_status_codes() {
        let resp = AppError::NotFound("nope".to_string()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

        let resp = AppError::ConfigError("bad".to_string()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
