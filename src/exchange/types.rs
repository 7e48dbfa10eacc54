//! Exchange domain types: identifiers, captured payloads, and the Exchange
//! record itself.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::ExchangeError;
use super::state::ExchangeState;

// ============================================================================
// Exchange ID
// ============================================================================

/// Prefix for holdpoint-generated exchange identifiers.
pub const EXCHANGE_ID_PREFIX: &str = "hp_";

/// Length of the nanoid body (excluding prefix).
pub const EXCHANGE_ID_BODY_LENGTH: usize = 21;

/// Opaque correlation token for one exchange.
///
/// Format: `hp_<nanoid>` where nanoid is 21 URL-safe characters. Generated
/// at intake, immutable, and never reused for the process lifetime. The id
/// is the sole handle passed between the serving task and the control API;
/// no other correlation (header matching, body matching) is permitted
/// because concurrent exchanges may carry identical payloads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Creates a new random exchange id.
    #[must_use]
    pub fn new() -> Self {
        let body = nanoid::nanoid!(EXCHANGE_ID_BODY_LENGTH);
        Self(format!("{EXCHANGE_ID_PREFIX}{body}"))
    }

    /// Wraps a raw string without validation. Intended for lookups of ids
    /// received from the control API.
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Payload body
// ============================================================================

/// Opaque body bytes with a structured wire representation for the operator.
///
/// Internally the body is raw bytes; what was captured is what gets
/// forwarded or returned, byte for byte, unless the operator edits it. For
/// display and editing the body serializes as a tagged view:
///
/// - `{"json": ...}` when the bytes parse as JSON,
/// - `{"text": "..."}` when they are valid UTF-8,
/// - `{"base64": "..."}` otherwise,
/// - `"empty"` for an empty body.
///
/// Submitting an edit in any of these forms replaces the raw bytes. A JSON
/// edit is re-encoded compactly, so formatting is not preserved across an
/// unmodified view-then-submit cycle; the payload semantics are.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadBody(Bytes);

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BodyRepr {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Base64(String),
}

impl PayloadBody {
    /// Wraps raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Encodes a JSON value as a compact body.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        // serde_json::Value serialization cannot fail
        Self(Bytes::from(serde_json::to_vec(value).unwrap_or_default()))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Consumes the body, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parses the bytes as JSON, if they are JSON.
    #[must_use]
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.0).ok()
    }

    fn to_repr(&self) -> BodyRepr {
        if self.0.is_empty() {
            return BodyRepr::Empty;
        }
        if let Some(value) = self.json() {
            return BodyRepr::Json(value);
        }
        match std::str::from_utf8(&self.0) {
            Ok(text) => BodyRepr::Text(text.to_string()),
            Err(_) => BodyRepr::Base64(base64_encode(&self.0)),
        }
    }

    fn from_repr(repr: BodyRepr) -> Result<Self, String> {
        match repr {
            BodyRepr::Empty => Ok(Self::default()),
            BodyRepr::Json(value) => Ok(Self::from_json(&value)),
            BodyRepr::Text(text) => Ok(Self(Bytes::from(text))),
            BodyRepr::Base64(encoded) => base64_decode(&encoded)
                .map(|bytes| Self(Bytes::from(bytes)))
                .ok_or_else(|| "invalid base64 body".to_string()),
        }
    }
}

impl From<Bytes> for PayloadBody {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl Serialize for PayloadBody {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_repr().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PayloadBody {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = BodyRepr::deserialize(deserializer)?;
        Self::from_repr(repr).map_err(serde::de::Error::custom)
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(encoded: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

// ============================================================================
// Captured payloads
// ============================================================================

/// An HTTP request captured at intake, or an operator-edited working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    /// HTTP method, uppercase.
    pub method: String,
    /// Path plus query string, e.g. `/v1/chat/completions`.
    pub path: String,
    /// Header pairs in wire order. Duplicates are preserved.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: PayloadBody,
}

/// An HTTP response captured after forwarding, a synthetic response supplied
/// by the operator, or an operator-edited working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Header pairs in wire order.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: PayloadBody,
}

impl CapturedResponse {
    /// Builds a JSON response with `content-type: application/json`.
    #[must_use]
    pub fn from_json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: PayloadBody::from_json(value),
        }
    }
}

// ============================================================================
// Failure cause
// ============================================================================

/// The two operator checkpoints in an exchange's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The upstream call failed (connection error, timeout, bad response).
    Upstream,
    /// A stage deadline elapsed before the operator released the exchange.
    Timeout,
    /// The service shut down while the exchange was still in flight.
    Shutdown,
    /// Unexpected failure inside the engine.
    Internal,
}

/// Why an exchange ended in the `Failed` state. Present only on failed
/// exchanges; kept for post-mortem inspection through the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable diagnostic.
    pub message: String,
}

impl FailureCause {
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Upstream,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(stage: Stage, timeout_secs: u64) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("{stage} stage not released within {timeout_secs}s"),
        }
    }

    #[must_use]
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Shutdown,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// One proxied call tracked end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    /// Unique correlation token, generated at intake.
    pub id: ExchangeId,
    /// Current lifecycle state.
    pub state: ExchangeState,
    /// The request exactly as the caller sent it. Never mutated; kept for
    /// audit and diffing against the working copy.
    pub original_request: CapturedRequest,
    /// The copy the operator may edit; this is what gets forwarded.
    pub working_request: CapturedRequest,
    /// The upstream response captured verbatim after forwarding. Absent
    /// when the operator fabricated a response and upstream was skipped.
    pub upstream_response: Option<CapturedResponse>,
    /// The copy the operator may edit; this is what the caller receives.
    pub working_response: Option<CapturedResponse>,
    /// When the exchange was created.
    pub created_at: DateTime<Utc>,
    /// When the request stage was released.
    pub released_request_at: Option<DateTime<Utc>>,
    /// When the response stage was released.
    pub released_response_at: Option<DateTime<Utc>>,
    /// Failure cause, present only in the `Failed` state.
    pub error: Option<FailureCause>,
}

impl Exchange {
    /// Creates a new exchange in `PendingRequest`, seeding the working
    /// request as a copy of the original.
    #[must_use]
    pub fn new(request: CapturedRequest) -> Self {
        Self {
            id: ExchangeId::new(),
            state: ExchangeState::PendingRequest,
            working_request: request.clone(),
            original_request: request,
            upstream_response: None,
            working_response: None,
            created_at: Utc::now(),
            released_request_at: None,
            released_response_at: None,
            error: None,
        }
    }

    /// Transitions the exchange to a new state.
    ///
    /// Terminal states are immutable; an incompatible transition fails with
    /// `InvalidState` and leaves the exchange untouched.
    pub fn transition(&mut self, to: ExchangeState) -> Result<(), ExchangeError> {
        if self.state.is_terminal() {
            return Err(ExchangeError::AlreadyTerminal {
                id: self.id.clone(),
                state: self.state,
            });
        }
        if !self.state.can_transition_to(to) {
            return Err(ExchangeError::InvalidState {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
