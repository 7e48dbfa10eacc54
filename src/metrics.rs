//! Prometheus metrics for the interception engine.
//!
//! Each [`Metrics`] instance owns its own registry so tests can build
//! isolated engines without colliding on a process-global registry. The
//! control server exposes the encoded text form at `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use crate::exchange::ExchangeState;

/// Counters and gauges kept by the engine.
pub struct Metrics {
    registry: Registry,
    exchanges_created: IntCounter,
    exchanges_finished: IntCounterVec,
    upstream_requests: IntCounterVec,
    exchanges_in_flight: IntGauge,
}

impl Metrics {
    /// Creates the metric set backed by a fresh registry.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let exchanges_created = IntCounter::with_opts(Opts::new(
            "holdpoint_exchanges_created_total",
            "Exchanges created at intake",
        ))
        .expect("static metric opts are valid");

        let exchanges_finished = IntCounterVec::new(
            Opts::new(
                "holdpoint_exchanges_finished_total",
                "Exchanges reaching a terminal state, by outcome",
            ),
            &["outcome"],
        )
        .expect("static metric opts are valid");

        let upstream_requests = IntCounterVec::new(
            Opts::new(
                "holdpoint_upstream_requests_total",
                "Upstream forwards attempted, by outcome",
            ),
            &["outcome"],
        )
        .expect("static metric opts are valid");

        let exchanges_in_flight = IntGauge::with_opts(Opts::new(
            "holdpoint_exchanges_in_flight",
            "Exchanges currently in a non-terminal state",
        ))
        .expect("static metric opts are valid");

        for collector in [
            Box::new(exchanges_created.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(exchanges_finished.clone()),
            Box::new(upstream_requests.clone()),
            Box::new(exchanges_in_flight.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                error!(error = %e, "Failed to register metric");
            }
        }

        Self {
            registry,
            exchanges_created,
            exchanges_finished,
            upstream_requests,
            exchanges_in_flight,
        }
    }

    /// Records intake of a new exchange.
    pub fn record_created(&self) {
        self.exchanges_created.inc();
        self.exchanges_in_flight.inc();
    }

    /// Records an exchange entering a terminal state.
    pub fn record_terminal(&self, state: ExchangeState) {
        let outcome = match state {
            ExchangeState::Completed => "completed",
            ExchangeState::Failed => "failed",
            ExchangeState::Cancelled => "cancelled",
            // Non-terminal states never reach here; the store only reports
            // terminal transitions.
            other => {
                error!(state = %other, "record_terminal called with non-terminal state");
                return;
            }
        };
        self.exchanges_finished.with_label_values(&[outcome]).inc();
        self.exchanges_in_flight.dec();
    }

    /// Records an upstream forward attempt.
    pub fn record_upstream(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.upstream_requests.with_label_values(&[outcome]).inc();
    }

    /// Encodes the registry in Prometheus text format.
    #[must_use]
    pub fn encode_text(&self) -> String {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_encoding() {
        let metrics = Metrics::new();
        metrics.record_created();
        metrics.record_terminal(ExchangeState::Completed);
        metrics.record_upstream(true);
        metrics.record_upstream(false);

        let text = metrics.encode_text();
        assert!(text.contains("holdpoint_exchanges_created_total 1"));
        assert!(text.contains("outcome=\"completed\""));
        assert!(text.contains("holdpoint_upstream_requests_total{outcome=\"error\"} 1"));
        assert!(text.contains("holdpoint_exchanges_in_flight 0"));
    }

    #[test]
    fn two_instances_do_not_collide() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.record_created();
        assert!(b.encode_text().contains("holdpoint_exchanges_created_total 0"));
    }
}
