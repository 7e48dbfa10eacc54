//! Serving-path errors and their mapping to caller-facing HTTP responses.
//!
//! The engine must never leave a caller's connection hanging: every failure
//! on the serving path converts into exactly one diagnostic HTTP response.
//! Control-API errors ([`crate::exchange::ExchangeError`]) are a separate
//! concern and are returned to the operator, never to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::exchange::{ExchangeId, Stage};

/// Errors that terminate an intercepted call on the serving path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Could not connect to the upstream server.
    #[error("cannot connect to upstream: {reason}")]
    UpstreamConnectionFailed {
        /// The upstream URL that failed
        url: String,
        /// Reason for the connection failure
        reason: String,
    },

    /// The upstream server did not respond in time.
    #[error("upstream did not respond within {timeout_secs}s")]
    UpstreamTimeout {
        /// The upstream URL that timed out
        url: String,
        /// The configured request timeout in seconds
        timeout_secs: u64,
    },

    /// The upstream call failed after connecting (protocol error, body read
    /// failure, oversized response).
    #[error("upstream request failed: {reason}")]
    UpstreamFailed {
        /// Reason for the failure
        reason: String,
    },

    /// The operator cancelled the exchange before release.
    #[error("exchange '{id}' was cancelled by the operator")]
    Cancelled {
        /// The cancelled exchange
        id: ExchangeId,
    },

    /// A stage deadline elapsed before the operator released the exchange.
    #[error("{stage} stage not released within {timeout_secs}s")]
    StageTimeout {
        /// Which checkpoint timed out
        stage: Stage,
        /// The configured deadline in seconds
        timeout_secs: u64,
    },

    /// The inbound request body exceeded the buffering limit.
    #[error("request body exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        /// The configured limit
        limit_bytes: usize,
    },

    /// Unexpected failure inside the engine.
    #[error("internal proxy error: {details}")]
    Internal {
        /// Diagnostic detail, logged but also safe for the caller
        details: String,
    },
}

impl GateError {
    /// Short name for logging, metrics labels, and the diagnostic body.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamConnectionFailed { .. } => "upstream_connection_failed",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamFailed { .. } => "upstream_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status delivered to the original caller.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UpstreamConnectionFailed { .. } | Self::UpstreamFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamTimeout { .. } | Self::StageTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Cancelled { .. } => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the diagnostic response delivered to the original caller.
    ///
    /// The body is JSON so OpenAI-compatible clients surface it readably:
    /// `{"error": {"type": "...", "message": "..."}}`.
    #[must_use]
    pub fn to_response(&self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        self.to_response()
    }
}
