//! Operator-facing control API.
//!
//! Serves on its own listener, separate from the caller-facing proxy, so
//! operator traffic can be firewalled independently. Every route keys off
//! the opaque exchange id; there is deliberately no other way to address a
//! parked exchange, because concurrent exchanges may carry identical
//! payloads.
//!
//! # Routes
//!
//! - `GET  /exchanges` - list, creation-ordered, optional `?state=` filter
//! - `GET  /exchanges/:id` - full exchange record
//! - `PUT  /exchanges/:id/request` - replace the working request
//! - `PUT  /exchanges/:id/response` - replace the working response
//! - `POST /exchanges/:id/release-request` - forward, or skip with a
//!   synthetic response
//! - `POST /exchanges/:id/release-response` - deliver to the caller
//! - `POST /exchanges/:id/cancel` - abort, caller gets 502
//! - `GET  /health`, `GET /metrics` - liveness and Prometheus text

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use crate::exchange::{
    CapturedRequest, CapturedResponse, Exchange, ExchangeError, ExchangeId, ExchangeState,
    ExchangeStore,
};
use crate::metrics::Metrics;
use crate::synthetic::{self, SyntheticReply};

/// Shared state for the control API.
#[derive(Clone)]
pub struct ControlState {
    pub store: Arc<ExchangeStore>,
    pub metrics: Arc<Metrics>,
}

/// Builds the control router.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/exchanges", get(list_exchanges))
        .route("/exchanges/:id", get(get_exchange))
        .route("/exchanges/:id/request", put(update_request))
        .route("/exchanges/:id/response", put(update_response))
        .route("/exchanges/:id/release-request", post(release_request))
        .route("/exchanges/:id/release-response", post(release_response))
        .route("/exchanges/:id/cancel", post(cancel))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Maps store errors onto operator-facing HTTP responses.
///
/// Unknown id is 404; everything else is a state conflict, 409, so the
/// operator can distinguish "gone" from "lost a race with another operator
/// action or a deadline".
fn error_response(e: &ExchangeError) -> Response {
    let status = match e {
        ExchangeError::NotFound { .. } => StatusCode::NOT_FOUND,
        ExchangeError::InvalidState { .. }
        | ExchangeError::AlreadyTerminal { .. }
        | ExchangeError::WrongStage { .. } => StatusCode::CONFLICT,
    };
    let body = serde_json::json!({
        "error": {
            "type": e.kind(),
            "message": e.to_string(),
        }
    });
    (status, Json(body)).into_response()
}

fn ok_exchange(exchange: &Exchange) -> Response {
    (StatusCode::OK, Json(exchange)).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListParams {
    /// Optional state filter, kebab-case (`pending-request`, ...).
    state: Option<String>,
}

async fn list_exchanges(
    State(state): State<ControlState>,
    Query(params): Query<ListParams>,
) -> Response {
    let filter = match params.state.as_deref() {
        Some(raw) => match ExchangeState::from_str(raw) {
            Ok(s) => Some(s),
            Err(_) => {
                let body = serde_json::json!({
                    "error": {
                        "type": "invalid_filter",
                        "message": format!("unknown state '{raw}'"),
                    }
                });
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
        },
        None => None,
    };

    let exchanges = state.store.list(filter);
    let records: Vec<&Exchange> = exchanges.iter().map(AsRef::as_ref).collect();
    (StatusCode::OK, Json(records)).into_response()
}

async fn get_exchange(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    let id = ExchangeId::from_raw(id);
    match state.store.get(&id) {
        Ok(exchange) => ok_exchange(&exchange),
        Err(e) => error_response(&e),
    }
}

async fn update_request(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(request): Json<CapturedRequest>,
) -> Response {
    let id = ExchangeId::from_raw(id);
    match state.store.update_working_request(&id, request) {
        Ok(exchange) => {
            info!(id = %id, "Working request replaced");
            ok_exchange(&exchange)
        }
        Err(e) => error_response(&e),
    }
}

async fn update_response(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(response): Json<CapturedResponse>,
) -> Response {
    let id = ExchangeId::from_raw(id);
    match state.store.update_working_response(&id, response) {
        Ok(exchange) => {
            info!(id = %id, "Working response replaced");
            ok_exchange(&exchange)
        }
        Err(e) => error_response(&e),
    }
}

/// Body for `release-request`. Empty (or absent) means forward upstream;
/// otherwise exactly one synthetic form is accepted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseRequestBody {
    /// A fully-specified synthetic response.
    synthetic: Option<CapturedResponse>,
    /// Shorthand: fabricate a chat completion with this content.
    synthetic_content: Option<String>,
    /// Shorthand: fabricate a chat completion with this tool call.
    synthetic_tool_call: Option<SyntheticToolCall>,
}

#[derive(Debug, Deserialize)]
struct SyntheticToolCall {
    name: String,
    arguments: String,
}

async fn release_request(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let id = ExchangeId::from_raw(id);
    // Parsed by hand: a malformed or typoed body must reject here, not
    // degrade into a plain release. Forwarding is not retractable.
    let body: ReleaseRequestBody = if body.is_empty() {
        ReleaseRequestBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let reject = serde_json::json!({
                    "error": {
                        "type": "invalid_release",
                        "message": format!("malformed release body: {e}"),
                    }
                });
                return (StatusCode::BAD_REQUEST, Json(reject)).into_response();
            }
        }
    };

    let supplied = [
        body.synthetic.is_some(),
        body.synthetic_content.is_some(),
        body.synthetic_tool_call.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if supplied > 1 {
        let reject = serde_json::json!({
            "error": {
                "type": "invalid_release",
                "message": "at most one synthetic form may be supplied",
            }
        });
        return (StatusCode::BAD_REQUEST, Json(reject)).into_response();
    }

    // The shorthand forms need the parked request for model/usage context.
    let synthetic = if body.synthetic.is_some() {
        body.synthetic
    } else {
        let reply = match (body.synthetic_content, body.synthetic_tool_call) {
            (Some(content), _) => Some(SyntheticReply::Content(content)),
            (_, Some(call)) => Some(SyntheticReply::ToolCall {
                name: call.name,
                arguments: call.arguments,
            }),
            _ => None,
        };
        match reply {
            Some(reply) => match state.store.get(&id) {
                Ok(exchange) => Some(synthetic::chat_completion(
                    &id,
                    &exchange.working_request,
                    &reply,
                )),
                Err(e) => return error_response(&e),
            },
            None => None,
        }
    };

    let skipped_upstream = synthetic.is_some();
    match state.store.release_request(&id, synthetic) {
        Ok(exchange) => {
            info!(id = %id, synthetic = skipped_upstream, "Request stage released");
            ok_exchange(&exchange)
        }
        Err(e) => error_response(&e),
    }
}

async fn release_response(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    let id = ExchangeId::from_raw(id);
    match state.store.release_response(&id) {
        Ok(exchange) => {
            info!(id = %id, "Response stage released");
            ok_exchange(&exchange)
        }
        Err(e) => error_response(&e),
    }
}

async fn cancel(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    let id = ExchangeId::from_raw(id);
    match state.store.cancel(&id) {
        Ok(exchange) => {
            info!(id = %id, "Exchange cancelled");
            ok_exchange(&exchange)
        }
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<ControlState>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "pending": state.store.pending_count(),
        "total": state.store.total_count(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn metrics(State(state): State<ControlState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode_text(),
    )
        .into_response()
}
