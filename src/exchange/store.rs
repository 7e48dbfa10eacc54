//! In-memory exchange store with concurrent access and per-exchange
//! release gates.
//!
//! The store is the only shared mutable resource between serving tasks and
//! the control API. Each exchange lives under its own DashMap entry, so
//! operations on one exchange never serialize operations on another. The
//! entry carries a `tokio::sync::Notify` that serves as the release signal:
//! a serving task parks on it at each checkpoint, and every control-API
//! mutation wakes the waiters so the task can re-examine the state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metrics::Metrics;

use super::error::ExchangeError;
use super::state::ExchangeState;
use super::types::{
    CapturedRequest, CapturedResponse, Exchange, ExchangeId, FailureCause, Stage,
};

// ============================================================================
// Store configuration
// ============================================================================

/// Configuration for the exchange store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long terminal exchanges are kept before eviction.
    pub terminal_grace_period: Duration,
    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            terminal_grace_period: Duration::from_secs(3600), // 1 hour
            eviction_interval: Duration::from_secs(60),
        }
    }
}

/// Floor applied to the configured grace period at eviction time. A
/// completed exchange must survive the gap between its release and the
/// serving task's wakeup, so even a zero grace keeps it around briefly.
const MIN_TERMINAL_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Wait errors
// ============================================================================

/// Errors from [`ExchangeStore::wait_released`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The exchange disappeared from the store while a task was waiting on
    /// it. Eviction never removes a non-terminal exchange, so this
    /// indicates an engine bug rather than an operator action.
    #[error("exchange '{id}' vanished from the store")]
    Gone {
        /// The exchange id
        id: ExchangeId,
    },

    /// The configured stage deadline elapsed before release.
    #[error("{stage} stage not released within {timeout_secs}s")]
    Timeout {
        /// Which checkpoint timed out
        stage: Stage,
        /// The configured deadline in seconds
        timeout_secs: u64,
    },
}

// ============================================================================
// Exchange store
// ============================================================================

/// Internal entry: the exchange plus its gate and eviction bookkeeping.
///
/// Stores `Arc<Exchange>` so reads hand out cheap snapshots. Mutations go
/// through `Arc::make_mut`, which clones only when a reader still holds a
/// previous snapshot (copy-on-write).
#[derive(Debug)]
struct ExchangeEntry {
    exchange: Arc<Exchange>,
    /// When the exchange became terminal, for grace-period eviction.
    terminal_at: Option<DateTime<Utc>>,
    /// Release signal for tasks parked on this exchange.
    notify: Arc<Notify>,
}

/// Concurrency-safe store of all in-flight and recently finished exchanges.
pub struct ExchangeStore {
    exchanges: DashMap<ExchangeId, ExchangeEntry>,
    config: StoreConfig,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ExchangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStore")
            .field("exchanges", &self.exchanges.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ExchangeStore {
    /// Creates a store with the given configuration.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            exchanges: DashMap::new(),
            config,
            metrics: None,
        }
    }

    /// Creates a store with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    /// Creates a store with metrics wired for counter updates.
    #[must_use]
    pub fn with_metrics(config: StoreConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            exchanges: DashMap::new(),
            config,
            metrics: Some(metrics),
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of non-terminal exchanges.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.exchanges
            .iter()
            .filter(|e| !e.exchange.state.is_terminal())
            .count()
    }

    /// Total number of exchanges, including terminal ones awaiting eviction.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.exchanges.len()
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Creates a new exchange in `PendingRequest` from a captured request.
    pub fn insert(&self, request: CapturedRequest) -> Arc<Exchange> {
        let exchange = Arc::new(Exchange::new(request));
        let id = exchange.id.clone();

        self.exchanges.insert(
            id.clone(),
            ExchangeEntry {
                exchange: exchange.clone(),
                terminal_at: None,
                notify: Arc::new(Notify::new()),
            },
        );

        if let Some(ref metrics) = self.metrics {
            metrics.record_created();
        }

        debug!(id = %id, "Exchange created");
        exchange
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Gets a snapshot of an exchange by id.
    pub fn get(&self, id: &ExchangeId) -> Result<Arc<Exchange>, ExchangeError> {
        self.exchanges
            .get(id)
            .map(|entry| entry.exchange.clone())
            .ok_or_else(|| ExchangeError::NotFound { id: id.clone() })
    }

    /// Lists exchanges, optionally filtered by state, ordered by creation
    /// time ascending (ties broken by id) so the operator sees a stable
    /// queue.
    #[must_use]
    pub fn list(&self, filter: Option<ExchangeState>) -> Vec<Arc<Exchange>> {
        let mut result: Vec<Arc<Exchange>> = self
            .exchanges
            .iter()
            .filter(|e| filter.is_none_or(|state| e.exchange.state == state))
            .map(|e| e.exchange.clone())
            .collect();
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        result
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Replaces the working request. Valid only while `PendingRequest`.
    pub fn update_working_request(
        &self,
        id: &ExchangeId,
        request: CapturedRequest,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            if exchange.state != ExchangeState::PendingRequest {
                return Err(ExchangeError::WrongStage {
                    id: exchange.id.clone(),
                    state: exchange.state,
                    required: ExchangeState::PendingRequest,
                });
            }
            exchange.working_request = request;
            Ok(())
        })
    }

    /// Replaces the working response. Valid only while `PendingResponse`.
    pub fn update_working_response(
        &self,
        id: &ExchangeId,
        response: CapturedResponse,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            if exchange.state != ExchangeState::PendingResponse {
                return Err(ExchangeError::WrongStage {
                    id: exchange.id.clone(),
                    state: exchange.state,
                    required: ExchangeState::PendingResponse,
                });
            }
            exchange.working_response = Some(response);
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Releases
    // ------------------------------------------------------------------------

    /// Releases the request stage, resuming the serving task.
    ///
    /// With `synthetic` supplied, the upstream call is skipped entirely: the
    /// exchange moves straight to `PendingResponse` with the synthetic
    /// payload as the working response and `upstream_response` left absent.
    /// A second release attempt fails with `InvalidState` without mutating.
    pub fn release_request(
        &self,
        id: &ExchangeId,
        synthetic: Option<CapturedResponse>,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            match synthetic {
                Some(response) => {
                    exchange.transition(ExchangeState::PendingResponse)?;
                    exchange.working_response = Some(response);
                }
                None => exchange.transition(ExchangeState::Forwarding)?,
            }
            exchange.released_request_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Records the upstream response and enters the response checkpoint.
    ///
    /// Called by the serving task once forwarding resolves; the upstream
    /// payload is kept verbatim and the working copy seeded from it.
    pub fn begin_response(
        &self,
        id: &ExchangeId,
        upstream: CapturedResponse,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            exchange.transition(ExchangeState::PendingResponse)?;
            exchange.working_response = Some(upstream.clone());
            exchange.upstream_response = Some(upstream);
            Ok(())
        })
    }

    /// Releases the response stage; the working response as of this call is
    /// what the serving task delivers to the original caller.
    pub fn release_response(&self, id: &ExchangeId) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            if exchange.state == ExchangeState::PendingResponse
                && exchange.working_response.is_none()
            {
                // Invariant: working_response exists before the exchange
                // leaves PendingResponse. begin_response and release_request
                // both seed it, so this is unreachable short of a bug.
                return Err(ExchangeError::WrongStage {
                    id: exchange.id.clone(),
                    state: exchange.state,
                    required: ExchangeState::PendingResponse,
                });
            }
            exchange.transition(ExchangeState::Completed)?;
            exchange.released_response_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Cancels a pending exchange, unblocking its serving task.
    ///
    /// Only the two checkpoint states can be cancelled. Once forwarding has
    /// begun the upstream call runs to completion or failure, though the
    /// response stage can still be edited, replaced, or cancelled.
    pub fn cancel(&self, id: &ExchangeId) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            exchange.transition(ExchangeState::Cancelled)
        })
    }

    /// Fails an exchange from any non-terminal state, recording the cause.
    pub fn fail(
        &self,
        id: &ExchangeId,
        cause: FailureCause,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        self.mutate(id, |exchange| {
            exchange.transition(ExchangeState::Failed)?;
            exchange.error = Some(cause.clone());
            Ok(())
        })
    }

    /// Fails an exchange only if it is still parked at the given checkpoint.
    ///
    /// Used by serving tasks on deadline expiry: once a release has been
    /// acknowledged to the operator, a late-firing timer must not overwrite
    /// it. Returns `WrongStage` when the state already moved on, leaving the
    /// exchange untouched.
    pub fn fail_if_pending(
        &self,
        id: &ExchangeId,
        stage: Stage,
        cause: FailureCause,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        let awaited = match stage {
            Stage::Request => ExchangeState::PendingRequest,
            Stage::Response => ExchangeState::PendingResponse,
        };
        self.mutate(id, |exchange| {
            if exchange.state != awaited {
                return Err(ExchangeError::WrongStage {
                    id: exchange.id.clone(),
                    state: exchange.state,
                    required: awaited,
                });
            }
            exchange.transition(ExchangeState::Failed)?;
            exchange.error = Some(cause);
            Ok(())
        })
    }

    /// Fails every non-terminal exchange, e.g. at shutdown, so no caller is
    /// left hanging without a response. Returns the number failed.
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let pending: Vec<ExchangeId> = self
            .exchanges
            .iter()
            .filter(|e| !e.exchange.state.is_terminal())
            .map(|e| e.exchange.id.clone())
            .collect();

        let mut failed = 0;
        for id in pending {
            if self.fail(&id, FailureCause::shutdown(reason)).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    // ------------------------------------------------------------------------
    // Gate
    // ------------------------------------------------------------------------

    /// Parks the calling task until the exchange leaves the given pending
    /// stage, then returns the post-release snapshot.
    ///
    /// Returns immediately if the exchange is already past the stage. With
    /// a deadline configured, the wait races the release signal against the
    /// timer; on expiry the caller decides what to do (typically fail the
    /// exchange). The gate is scoped to this exchange's own `Notify`, so N
    /// concurrent exchanges yield N independent, individually-resumable
    /// suspensions.
    pub async fn wait_released(
        &self,
        id: &ExchangeId,
        stage: Stage,
        deadline: Option<Duration>,
    ) -> Result<Arc<Exchange>, WaitError> {
        let awaited = match stage {
            Stage::Request => ExchangeState::PendingRequest,
            Stage::Response => ExchangeState::PendingResponse,
        };
        let timeout_at = deadline.map(|d| tokio::time::Instant::now() + d);

        loop {
            let notify = {
                let entry = self
                    .exchanges
                    .get(id)
                    .ok_or_else(|| WaitError::Gone { id: id.clone() })?;
                entry.notify.clone()
            };

            // Create the notified future BEFORE checking state, so a
            // release that lands between the check and the await is not
            // missed.
            let notified = notify.notified();

            {
                let entry = self
                    .exchanges
                    .get(id)
                    .ok_or_else(|| WaitError::Gone { id: id.clone() })?;
                if entry.exchange.state != awaited {
                    return Ok(entry.exchange.clone());
                }
            }

            match timeout_at {
                Some(at) => {
                    let now = tokio::time::Instant::now();
                    if now >= at {
                        return Err(WaitError::Timeout {
                            stage,
                            timeout_secs: deadline.unwrap_or_default().as_secs(),
                        });
                    }
                    if tokio::time::timeout(at - now, notified).await.is_err() {
                        // Deadline hit; one final check in case the release
                        // raced the timer.
                        let entry = self
                            .exchanges
                            .get(id)
                            .ok_or_else(|| WaitError::Gone { id: id.clone() })?;
                        if entry.exchange.state != awaited {
                            return Ok(entry.exchange.clone());
                        }
                        return Err(WaitError::Timeout {
                            stage,
                            timeout_secs: deadline.unwrap_or_default().as_secs(),
                        });
                    }
                }
                None => notified.await,
            }
            // Notified; loop to re-check (handles spurious wakeups and
            // mutations that did not change the state).
        }
    }

    // ------------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------------

    /// Removes terminal exchanges older than the grace period (floored at
    /// [`MIN_TERMINAL_GRACE`]). Non-terminal exchanges are never evicted,
    /// so an exchange still awaiting release cannot disappear under its
    /// serving task or the operator.
    pub fn evict_terminal(&self) -> usize {
        let now = Utc::now();
        let grace = self.config.terminal_grace_period.max(MIN_TERMINAL_GRACE);
        let grace =
            chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::hours(1));

        let to_remove: Vec<ExchangeId> = self
            .exchanges
            .iter()
            .filter_map(|entry| match entry.terminal_at {
                Some(terminal_at) if now - terminal_at > grace => {
                    Some(entry.exchange.id.clone())
                }
                _ => None,
            })
            .collect();

        let count = to_remove.len();
        for id in to_remove {
            self.exchanges.remove(&id);
            debug!(id = %id, "Exchange evicted");
        }
        count
    }

    /// Test hook: backdates when an exchange became terminal.
    #[cfg(test)]
    fn force_terminal_at(&self, id: &ExchangeId, at: DateTime<Utc>) {
        if let Some(mut entry) = self.exchanges.get_mut(id) {
            entry.terminal_at = Some(at);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Applies a mutation under the entry lock, then wakes waiters and
    /// maintains terminal bookkeeping. The closure either fully applies or
    /// fails without mutating observable state (transition checks run
    /// before any field writes).
    fn mutate(
        &self,
        id: &ExchangeId,
        f: impl FnOnce(&mut Exchange) -> Result<(), ExchangeError>,
    ) -> Result<Arc<Exchange>, ExchangeError> {
        let mut entry = self
            .exchanges
            .get_mut(id)
            .ok_or_else(|| ExchangeError::NotFound { id: id.clone() })?;

        let was_terminal = entry.exchange.state.is_terminal();
        f(Arc::make_mut(&mut entry.exchange))?;

        if !was_terminal && entry.exchange.state.is_terminal() {
            entry.terminal_at = Some(Utc::now());
            if let Some(ref metrics) = self.metrics {
                metrics.record_terminal(entry.exchange.state);
            }
            if entry.exchange.state == ExchangeState::Failed {
                warn!(
                    id = %id,
                    error = ?entry.exchange.error,
                    "Exchange failed"
                );
            }
        }

        entry.notify.notify_waiters();
        Ok(entry.exchange.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::exchange::types::PayloadBody;

    fn request(body: &'static [u8]) -> CapturedRequest {
        CapturedRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: PayloadBody::from_bytes(Bytes::from_static(body)),
        }
    }

    fn response(status: u16, body: &'static [u8]) -> CapturedResponse {
        CapturedResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: PayloadBody::from_bytes(Bytes::from_static(body)),
        }
    }

    #[test]
    fn insert_and_get() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));

        let fetched = store.get(&ex.id).unwrap();
        assert_eq!(fetched.id, ex.id);
        assert_eq!(fetched.state, ExchangeState::PendingRequest);

        let missing = store.get(&ExchangeId::from_raw("hp_missing"));
        assert!(matches!(missing, Err(ExchangeError::NotFound { .. })));
    }

    #[test]
    fn list_orders_by_creation() {
        let store = ExchangeStore::with_defaults();
        let first = store.insert(request(b"1"));
        let second = store.insert(request(b"2"));
        let third = store.insert(request(b"3"));

        let ids: Vec<ExchangeId> = store.list(None).iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone(), third.id.clone()]);

        // Releasing the second does not disturb the others' pending state.
        store.release_request(&second.id, None).unwrap();
        let pending = store.list(Some(ExchangeState::PendingRequest));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(store.get(&first.id).unwrap().state, ExchangeState::PendingRequest);
    }

    #[test]
    fn release_request_is_single_shot() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));

        store.release_request(&ex.id, None).unwrap();
        let snapshot = store.get(&ex.id).unwrap();
        assert_eq!(snapshot.state, ExchangeState::Forwarding);
        assert!(snapshot.released_request_at.is_some());

        let second = store.release_request(&ex.id, None);
        assert!(matches!(second, Err(ExchangeError::InvalidState { .. })));
        // State unchanged by the failed release.
        assert_eq!(store.get(&ex.id).unwrap().state, ExchangeState::Forwarding);
    }

    #[test]
    fn synthetic_release_skips_forwarding() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));

        let snapshot = store
            .release_request(&ex.id, Some(response(200, b"{\"fabricated\":true}")))
            .unwrap();
        assert_eq!(snapshot.state, ExchangeState::PendingResponse);
        assert!(snapshot.upstream_response.is_none());
        assert_eq!(
            snapshot.working_response.as_ref().unwrap().body.as_bytes().as_ref(),
            b"{\"fabricated\":true}"
        );
    }

    #[test]
    fn edit_fidelity_through_stages() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{\"model\":\"gpt-4\"}"));

        let mut edited = store.get(&ex.id).unwrap().working_request.clone();
        edited.body = PayloadBody::from_bytes(Bytes::from_static(b"{\"model\":\"gpt-4o\"}"));
        store.update_working_request(&ex.id, edited).unwrap();

        let snapshot = store.release_request(&ex.id, None).unwrap();
        assert_eq!(
            snapshot.working_request.body.as_bytes().as_ref(),
            b"{\"model\":\"gpt-4o\"}"
        );
        // Original is preserved verbatim for diffing.
        assert_eq!(
            snapshot.original_request.body.as_bytes().as_ref(),
            b"{\"model\":\"gpt-4\"}"
        );

        // Request edits are rejected once the stage has passed.
        let late = store.update_working_request(&ex.id, snapshot.working_request.clone());
        assert!(matches!(late, Err(ExchangeError::WrongStage { .. })));
    }

    #[test]
    fn full_lifecycle_to_completed() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));

        store.release_request(&ex.id, None).unwrap();
        let snapshot = store
            .begin_response(&ex.id, response(200, b"{\"choices\":[]}"))
            .unwrap();
        assert_eq!(snapshot.state, ExchangeState::PendingResponse);
        assert_eq!(
            snapshot.upstream_response.as_ref().unwrap().body.as_bytes(),
            snapshot.working_response.as_ref().unwrap().body.as_bytes()
        );

        let done = store.release_response(&ex.id).unwrap();
        assert_eq!(done.state, ExchangeState::Completed);
        assert!(done.released_response_at.is_some());

        // Completed exchanges are immutable.
        let again = store.release_response(&ex.id);
        assert!(matches!(again, Err(ExchangeError::AlreadyTerminal { .. })));
        let edit = store.update_working_response(&ex.id, response(200, b"{}"));
        assert!(matches!(edit, Err(ExchangeError::WrongStage { .. })));
    }

    #[test]
    fn cancel_semantics() {
        let store = ExchangeStore::with_defaults();

        // Cancellable at the request checkpoint.
        let ex = store.insert(request(b"{}"));
        let cancelled = store.cancel(&ex.id).unwrap();
        assert_eq!(cancelled.state, ExchangeState::Cancelled);
        let again = store.cancel(&ex.id);
        assert!(matches!(again, Err(ExchangeError::AlreadyTerminal { .. })));

        // Not retractable once forwarding began.
        let ex = store.insert(request(b"{}"));
        store.release_request(&ex.id, None).unwrap();
        let mid_forward = store.cancel(&ex.id);
        assert!(matches!(mid_forward, Err(ExchangeError::InvalidState { .. })));

        // Cancellable again at the response checkpoint.
        store.begin_response(&ex.id, response(200, b"{}")).unwrap();
        let cancelled = store.cancel(&ex.id).unwrap();
        assert_eq!(cancelled.state, ExchangeState::Cancelled);
    }

    #[test]
    fn fail_records_cause() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));
        store.release_request(&ex.id, None).unwrap();

        let failed = store
            .fail(&ex.id, FailureCause::upstream("connection refused"))
            .unwrap();
        assert_eq!(failed.state, ExchangeState::Failed);
        assert_eq!(failed.error.as_ref().unwrap().message, "connection refused");

        let again = store.fail(&ex.id, FailureCause::internal("shouldn't land"));
        assert!(matches!(again, Err(ExchangeError::AlreadyTerminal { .. })));
    }

    #[test]
    fn deadline_fail_yields_to_concurrent_release() {
        let store = ExchangeStore::with_defaults();

        // Release landed before the deadline-driven fail: the fail must
        // lose and leave the state as released.
        let ex = store.insert(request(b"{}"));
        store.release_request(&ex.id, None).unwrap();
        let late = store.fail_if_pending(
            &ex.id,
            Stage::Request,
            FailureCause::timeout(Stage::Request, 1),
        );
        assert!(matches!(late, Err(ExchangeError::WrongStage { .. })));
        assert_eq!(store.get(&ex.id).unwrap().state, ExchangeState::Forwarding);

        // Still parked: the fail applies and records the cause.
        let ex = store.insert(request(b"{}"));
        let failed = store
            .fail_if_pending(
                &ex.id,
                Stage::Request,
                FailureCause::timeout(Stage::Request, 1),
            )
            .unwrap();
        assert_eq!(failed.state, ExchangeState::Failed);
        assert!(failed.error.is_some());
    }

    #[test]
    fn fail_all_pending_spares_terminal() {
        let store = ExchangeStore::with_defaults();
        let live = store.insert(request(b"{}"));
        let done = store.insert(request(b"{}"));
        store.cancel(&done.id).unwrap();

        let failed = store.fail_all_pending("shutting down");
        assert_eq!(failed, 1);
        assert_eq!(store.get(&live.id).unwrap().state, ExchangeState::Failed);
        assert_eq!(store.get(&done.id).unwrap().state, ExchangeState::Cancelled);
    }

    #[tokio::test]
    async fn wait_released_returns_immediately_when_past_stage() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));
        store.release_request(&ex.id, None).unwrap();

        let snapshot = store
            .wait_released(&ex.id, Stage::Request, None)
            .await
            .unwrap();
        assert_eq!(snapshot.state, ExchangeState::Forwarding);
    }

    #[tokio::test]
    async fn wait_released_wakes_on_release() {
        let store = Arc::new(ExchangeStore::with_defaults());
        let ex = store.insert(request(b"{}"));

        let waiter = {
            let store = store.clone();
            let id = ex.id.clone();
            tokio::spawn(async move { store.wait_released(&id, Stage::Request, None).await })
        };

        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.release_request(&ex.id, None).unwrap();

        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.state, ExchangeState::Forwarding);
    }

    #[tokio::test]
    async fn waiters_are_scoped_per_exchange() {
        let store = Arc::new(ExchangeStore::with_defaults());
        let a = store.insert(request(b"a"));
        let b = store.insert(request(b"b"));

        let wait_a = {
            let store = store.clone();
            let id = a.id.clone();
            tokio::spawn(async move { store.wait_released(&id, Stage::Request, None).await })
        };
        let wait_b = {
            let store = store.clone();
            let id = b.id.clone();
            tokio::spawn(async move { store.wait_released(&id, Stage::Request, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Release b (created second) first; a must stay parked.
        store.release_request(&b.id, None).unwrap();

        let snapshot_b = wait_b.await.unwrap().unwrap();
        assert_eq!(snapshot_b.state, ExchangeState::Forwarding);

        assert!(!wait_a.is_finished());
        assert_eq!(
            store.get(&a.id).unwrap().state,
            ExchangeState::PendingRequest
        );

        store.cancel(&a.id).unwrap();
        let snapshot_a = wait_a.await.unwrap().unwrap();
        assert_eq!(snapshot_a.state, ExchangeState::Cancelled);
    }

    #[tokio::test]
    async fn wait_released_times_out() {
        let store = ExchangeStore::with_defaults();
        let ex = store.insert(request(b"{}"));

        let result = store
            .wait_released(&ex.id, Stage::Request, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(WaitError::Timeout { stage: Stage::Request, .. })));
        // The exchange itself is untouched; the caller decides how to fail it.
        assert_eq!(
            store.get(&ex.id).unwrap().state,
            ExchangeState::PendingRequest
        );
    }

    #[test]
    fn eviction_spares_pending_and_fresh_terminal() {
        let store = ExchangeStore::new(StoreConfig {
            terminal_grace_period: Duration::from_secs(0),
            ..StoreConfig::default()
        });

        let pending = store.insert(request(b"{}"));
        let finished = store.insert(request(b"{}"));
        store.cancel(&finished.id).unwrap();

        // Zero grace is floored: a just-finished exchange survives the
        // sweep so its serving task can still deliver the response.
        assert_eq!(store.evict_terminal(), 0);
        assert!(store.get(&finished.id).is_ok());

        // Past the floor it goes; pending never does.
        store.force_terminal_at(&finished.id, Utc::now() - chrono::Duration::seconds(30));
        assert_eq!(store.evict_terminal(), 1);
        assert!(store.get(&pending.id).is_ok());
        assert!(matches!(
            store.get(&finished.id),
            Err(ExchangeError::NotFound { .. })
        ));
    }
}
