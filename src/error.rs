//! Error taxonomy for the gateway core.
//!
//! `DispatchError` covers everything that can terminate a single forwarding
//! attempt or an entire request. It classifies into retryable vs. terminal
//! via `retryable()`, and into the HTTP status the client ultimately sees via
//! `http_status()`.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    #[error("upstream unreachable: {0}")]
    ConnectError(String),

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream returned {status}")]
    Upstream5xx { status: u16, retry_count: u32 },

    #[error("upstream returned {status}")]
    Upstream4xx { status: u16, body_snippet: String },

    #[error("stream interrupted after bytes were flushed to the client")]
    StreamInterrupted,

    #[error("suspended request exceeded suspend_timeout")]
    SuspendTimeout,

    #[error("suspended-request table at capacity")]
    SuspendCapExceeded,

    #[error("client disconnected")]
    ClientCancelled,

    #[error("no endpoint group is active")]
    NoActiveGroup,

    #[error("request body exceeds configured cap of {cap_bytes} bytes")]
    BodyTooLarge { cap_bytes: usize },
}

impl DispatchError {
    /// Whether the Dispatcher may retry this failure against another
    /// attempt/endpoint.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectError(_)
                | DispatchError::Timeout
                | DispatchError::Upstream5xx { .. }
        )
    }

    /// The `status` field recorded on the lifecycle record and, for terminal
    /// failures, the status returned to the client.
    pub fn http_status(&self) -> StatusCode {
        match self {
            DispatchError::ConnectError(_) | DispatchError::Timeout => StatusCode::BAD_GATEWAY,
            DispatchError::Upstream5xx { status, .. } | DispatchError::Upstream4xx { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DispatchError::StreamInterrupted => StatusCode::BAD_GATEWAY,
            DispatchError::SuspendTimeout => StatusCode::GATEWAY_TIMEOUT,
            // 503, not 429: the suspended-request table being full is about
            // the proxy's own pool being unusable, not the client's request
            // rate.
            DispatchError::SuspendCapExceeded => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::ClientCancelled => StatusCode::BAD_GATEWAY,
            DispatchError::NoActiveGroup => StatusCode::BAD_GATEWAY,
            DispatchError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// The failure-reason string carried on a `failed`/`timeout`/`cancelled`
    /// lifecycle record.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            DispatchError::ConnectError(_) => "connect_error",
            DispatchError::Timeout => "timeout",
            DispatchError::Upstream5xx { .. } => "upstream_5xx",
            DispatchError::Upstream4xx { .. } => "upstream_4xx",
            DispatchError::StreamInterrupted => "stream_interrupted",
            DispatchError::SuspendTimeout => "suspend_timeout",
            DispatchError::SuspendCapExceeded => "capacity",
            DispatchError::ClientCancelled => "client_cancelled",
            DispatchError::NoActiveGroup => "no_active_group",
            DispatchError::BodyTooLarge { .. } => "body_too_large",
        }
    }

    /// Total attempts consumed before this error was returned, when known
    /// (on full exhaustion this equals `candidates × max_attempts` exactly).
    /// `None` for errors that short-circuit before any attempt is made.
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            DispatchError::Upstream5xx { retry_count, .. } => Some(*retry_count),
            _ => None,
        }
    }
}
