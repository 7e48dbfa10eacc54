//! Inbound proxy: the caller-facing serving path.
//!
//! Every inbound request lands here. Intercepted paths run the full
//! park/edit/release cycle against the exchange store; everything else is
//! relayed to upstream transparently. Either way the caller's connection
//! stays open until a final response exists, and every failure mode
//! converts into exactly one diagnostic HTTP response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tracing::{info, warn};

use crate::config::HoldpointConfig;
use crate::error::GateError;
use crate::exchange::{
    CapturedRequest, CapturedResponse, Exchange, ExchangeId, ExchangeState, ExchangeStore,
    FailureCause, FailureKind, PayloadBody, Stage, WaitError,
};
use crate::relay::{is_hop_by_hop_header, Relay};

/// Shared state for the serving path.
#[derive(Clone)]
pub struct ProxyState {
    pub store: Arc<ExchangeStore>,
    pub relay: Relay,
    pub config: Arc<HoldpointConfig>,
}

/// Builds the caller-facing router. A single fallback handler sees every
/// method and path; routing decisions (intercept vs. passthrough) live in
/// the handler because they depend on runtime configuration.
pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let body = match axum::body::to_bytes(body, state.config.req_buffer_max).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(
                path = %path,
                limit_bytes = state.config.req_buffer_max,
                "Inbound request body exceeds buffering limit"
            );
            return GateError::PayloadTooLarge {
                limit_bytes: state.config.req_buffer_max,
            }
            .into_response();
        }
    };

    let captured = CapturedRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body: PayloadBody::from_bytes(body),
    };

    let result = if state.config.intercepts(&captured.path) {
        serve_intercepted(&state, captured).await
    } else {
        serve_passthrough(&state, &captured).await
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Relays a non-intercepted request straight to upstream.
async fn serve_passthrough(
    state: &ProxyState,
    request: &CapturedRequest,
) -> Result<Response, GateError> {
    let upstream = state.relay.forward(request).await?;
    build_response(&upstream)
}

/// Runs the full interception cycle for one inbound call.
///
/// The exchange is parked at the request checkpoint, forwarded (or skipped
/// with a synthetic response) on release, parked again at the response
/// checkpoint, and finally delivered. The calling task owns the caller's
/// connection for the whole cycle.
async fn serve_intercepted(
    state: &ProxyState,
    captured: CapturedRequest,
) -> Result<Response, GateError> {
    let exchange = state.store.insert(captured);
    let id = exchange.id.clone();

    info!(
        id = %id,
        method = %exchange.original_request.method,
        path = %exchange.original_request.path,
        "Exchange parked; awaiting request release"
    );

    // --- Request checkpoint ---
    let snapshot = wait_stage(state, &id, Stage::Request, state.config.request_stage_timeout)
        .await?;

    match snapshot.state {
        ExchangeState::Forwarding => {
            let upstream = match state.relay.forward(&snapshot.working_request).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    // Record the failure so the operator sees why the
                    // exchange died; the caller gets the original error.
                    let _ = state.store.fail(&id, FailureCause::upstream(e.to_string()));
                    return Err(e);
                }
            };
            if let Err(store_err) = state.store.begin_response(&id, upstream) {
                // The exchange was failed out from under us (e.g. shutdown)
                // while the upstream call was in flight.
                warn!(id = %id, error = %store_err, "Exchange left Forwarding during upstream call");
                return Err(resolve_terminal_error(state, &id));
            }
        }
        // Synthetic release: upstream skipped, response already seeded. The
        // operator may even have released both stages before this task woke,
        // in which case the response checkpoint resolves immediately below.
        ExchangeState::PendingResponse | ExchangeState::Completed => {}
        ExchangeState::Cancelled => return Err(GateError::Cancelled { id }),
        ExchangeState::Failed => return Err(failure_to_gate_error(&snapshot)),
        other => {
            return Err(GateError::Internal {
                details: format!("exchange '{id}' in unexpected state '{other}' after request release"),
            })
        }
    }

    // --- Response checkpoint ---
    let snapshot = wait_stage(
        state,
        &id,
        Stage::Response,
        state.config.response_stage_timeout,
    )
    .await?;

    match snapshot.state {
        ExchangeState::Completed => {
            let response = snapshot.working_response.as_ref().ok_or_else(|| {
                GateError::Internal {
                    details: format!("completed exchange '{id}' has no response"),
                }
            })?;
            info!(
                id = %id,
                status = response.status,
                synthetic = snapshot.upstream_response.is_none(),
                "Exchange completed; delivering response"
            );
            build_response(response)
        }
        ExchangeState::Cancelled => Err(GateError::Cancelled { id }),
        ExchangeState::Failed => Err(failure_to_gate_error(&snapshot)),
        other => Err(GateError::Internal {
            details: format!("exchange '{id}' in unexpected state '{other}' after response release"),
        }),
    }
}

/// Parks on a checkpoint, converting a deadline expiry into a recorded
/// failure on the exchange plus a caller-facing timeout error.
///
/// The fail is conditional on the exchange still being parked: if the
/// operator's release landed just as the timer fired, the wait is
/// re-entered and returns immediately with the released snapshot instead
/// of overriding an already-acknowledged release.
async fn wait_stage(
    state: &ProxyState,
    id: &ExchangeId,
    stage: Stage,
    deadline: Option<std::time::Duration>,
) -> Result<Arc<Exchange>, GateError> {
    loop {
        match state.store.wait_released(id, stage, deadline).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(WaitError::Gone { id }) => {
                return Err(GateError::Internal {
                    details: format!("exchange '{id}' vanished while parked"),
                })
            }
            Err(WaitError::Timeout {
                stage,
                timeout_secs,
            }) => {
                match state
                    .store
                    .fail_if_pending(id, stage, FailureCause::timeout(stage, timeout_secs))
                {
                    Ok(_) => {
                        warn!(id = %id, stage = %stage, timeout_secs, "Stage deadline elapsed");
                        return Err(GateError::StageTimeout {
                            stage,
                            timeout_secs,
                        });
                    }
                    // State advanced concurrently; re-check.
                    Err(_) => continue,
                }
            }
        }
    }
}

/// Maps a failed exchange's recorded cause to the caller-facing error.
fn failure_to_gate_error(exchange: &Exchange) -> GateError {
    match &exchange.error {
        Some(cause) => match cause.kind {
            FailureKind::Internal => GateError::Internal {
                details: cause.message.clone(),
            },
            FailureKind::Upstream | FailureKind::Timeout | FailureKind::Shutdown => {
                GateError::UpstreamFailed {
                    reason: cause.message.clone(),
                }
            }
        },
        None => GateError::Internal {
            details: format!("exchange '{}' failed without a recorded cause", exchange.id),
        },
    }
}

/// Re-reads a concurrently-terminated exchange and derives the caller error.
fn resolve_terminal_error(state: &ProxyState, id: &ExchangeId) -> GateError {
    match state.store.get(id) {
        Ok(exchange) if exchange.state == ExchangeState::Cancelled => {
            GateError::Cancelled { id: id.clone() }
        }
        Ok(exchange) => failure_to_gate_error(&exchange),
        Err(_) => GateError::Internal {
            details: format!("exchange '{id}' vanished while forwarding"),
        },
    }
}

/// Converts a captured response into the HTTP response sent to the caller.
///
/// Hop-by-hop headers and `content-length` are dropped; the latter is
/// recomputed from the (possibly edited) body.
fn build_response(captured: &CapturedResponse) -> Result<Response, GateError> {
    let mut builder = Response::builder().status(captured.status);
    for (name, value) in &captured.headers {
        if is_hop_by_hop_header(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(Bytes::clone(captured.body.as_bytes())))
        .map_err(|e| GateError::Internal {
            details: format!("invalid captured response: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;
    use tower::ServiceExt;

    fn test_state(intercept: bool) -> ProxyState {
        let mut config = HoldpointConfig::default();
        if !intercept {
            config.intercept_paths.clear();
        }
        // Unroutable upstream: these tests never reach it.
        let relay = Relay::new(RelayConfig::with_base_url("http://127.0.0.1:1")).unwrap();
        ProxyState {
            store: Arc::new(ExchangeStore::with_defaults()),
            relay,
            config: Arc::new(config),
        }
    }

    fn chat_request() -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"model":"gpt-4","messages":[]}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn synthetic_release_skips_upstream() {
        let state = test_state(true);
        let store = state.store.clone();
        let app = router(state);

        let serve = tokio::spawn(app.oneshot(chat_request()));

        // Operator side: find the parked exchange and release it with a
        // fabricated response, then release the response stage.
        let id = loop {
            if let Some(ex) = store.list(None).first() {
                break ex.id.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        let synthetic = CapturedResponse::from_json(200, &serde_json::json!({"ok": true}));
        store.release_request(&id, Some(synthetic)).unwrap();
        store.release_response(&id).unwrap();

        let response = serve.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);

        // Upstream was never contacted.
        let exchange = store.get(&id).unwrap();
        assert!(exchange.upstream_response.is_none());
        assert_eq!(exchange.state, ExchangeState::Completed);
    }

    #[tokio::test]
    async fn cancellation_unblocks_caller_with_bad_gateway() {
        let state = test_state(true);
        let store = state.store.clone();
        let app = router(state);

        let serve = tokio::spawn(app.oneshot(chat_request()));

        let id = loop {
            if let Some(ex) = store.list(None).first() {
                break ex.id.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        store.cancel(&id).unwrap();

        let response = serve.await.unwrap().unwrap();
        assert_eq!(response.status(), 502);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "cancelled");
    }

    #[tokio::test]
    async fn oversized_body_rejected_before_parking() {
        let mut config = HoldpointConfig::default();
        config.req_buffer_max = 16;
        let relay = Relay::new(RelayConfig::with_base_url("http://127.0.0.1:1")).unwrap();
        let store = Arc::new(ExchangeStore::with_defaults());
        let app = router(ProxyState {
            store: store.clone(),
            relay,
            config: Arc::new(config),
        });

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 413);
        assert_eq!(store.total_count(), 0);
    }

    #[tokio::test]
    async fn request_stage_timeout_fails_exchange() {
        let mut config = HoldpointConfig::default();
        config.request_stage_timeout = Some(std::time::Duration::from_millis(50));
        let relay = Relay::new(RelayConfig::with_base_url("http://127.0.0.1:1")).unwrap();
        let store = Arc::new(ExchangeStore::with_defaults());
        let app = router(ProxyState {
            store: store.clone(),
            relay,
            config: Arc::new(config),
        });

        let response = app.oneshot(chat_request()).await.unwrap();
        assert_eq!(response.status(), 504);

        let exchange = store.list(None).first().cloned().unwrap();
        assert_eq!(exchange.state, ExchangeState::Failed);
        assert!(exchange.error.is_some());
    }

    #[tokio::test]
    async fn passthrough_upstream_unreachable_is_bad_gateway() {
        let state = test_state(false);
        let app = router(state);

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 502);
    }
}
