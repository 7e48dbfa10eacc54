//! Centralized runtime configuration.
//!
//! All parameters can be overridden via `HOLDPOINT_*` environment
//! variables; listen addresses and the upstream URL are additionally
//! exposed as CLI flags in `main`.

use std::time::Duration;

use crate::exchange::StoreConfig;

/// Runtime configuration for the interception engine.
#[derive(Debug, Clone)]
pub struct HoldpointConfig {
    /// Base URL of the upstream OpenAI-compatible server. Intercepted and
    /// passthrough traffic alike is forwarded here.
    pub upstream_url: String,

    /// Request paths (exact match, query string excluded) that run the
    /// full pause/edit/release cycle. Everything else is relayed
    /// transparently.
    pub intercept_paths: Vec<String>,

    /// Optional deadline for the request checkpoint. `None` means a parked
    /// exchange waits for the operator indefinitely.
    pub request_stage_timeout: Option<Duration>,

    /// Optional deadline for the response checkpoint.
    pub response_stage_timeout: Option<Duration>,

    /// Connection timeout for the upstream client (TCP + TLS handshake).
    pub upstream_connect_timeout: Duration,

    /// Total upstream request timeout. Generous by default; LLM backends
    /// are slow.
    pub upstream_request_timeout: Duration,

    /// Maximum buffered inbound request body size in bytes. Larger bodies
    /// receive 413 Payload Too Large.
    pub req_buffer_max: usize,

    /// Maximum buffered upstream response body size in bytes. Larger
    /// responses fail the exchange with an upstream error.
    pub resp_buffer_max: usize,

    /// How long terminal exchanges remain visible to the operator before
    /// the background sweep evicts them.
    pub terminal_grace_period: Duration,

    /// Interval of the eviction sweep.
    pub eviction_interval: Duration,
}

impl Default for HoldpointConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.openai.com/v1".to_string(),
            intercept_paths: vec!["/v1/chat/completions".to_string()],
            request_stage_timeout: None,
            response_stage_timeout: None,
            upstream_connect_timeout: Duration::from_secs(5),
            upstream_request_timeout: Duration::from_secs(120),
            req_buffer_max: 2 * 1024 * 1024,   // 2 MB
            resp_buffer_max: 10 * 1024 * 1024, // 10 MB
            terminal_grace_period: Duration::from_secs(3600),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

impl HoldpointConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `HOLDPOINT_UPSTREAM` (default: `https://api.openai.com/v1`)
    /// - `HOLDPOINT_INTERCEPT_PATHS` (comma-separated, default:
    ///   `/v1/chat/completions`)
    /// - `HOLDPOINT_REQUEST_STAGE_TIMEOUT_SECS` (default: unset; `0`
    ///   also disables the deadline)
    /// - `HOLDPOINT_RESPONSE_STAGE_TIMEOUT_SECS` (default: unset)
    /// - `HOLDPOINT_UPSTREAM_CONNECT_TIMEOUT_SECS` (default: 5)
    /// - `HOLDPOINT_UPSTREAM_REQUEST_TIMEOUT_SECS` (default: 120)
    /// - `HOLDPOINT_REQ_BUFFER_MAX` (default: 2097152 = 2MB)
    /// - `HOLDPOINT_RESP_BUFFER_MAX` (default: 10485760 = 10MB)
    /// - `HOLDPOINT_TERMINAL_GRACE_SECS` (default: 3600)
    /// - `HOLDPOINT_EVICTION_INTERVAL_SECS` (default: 60)
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            upstream_url: std::env::var("HOLDPOINT_UPSTREAM")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.upstream_url),

            intercept_paths: std::env::var("HOLDPOINT_INTERCEPT_PATHS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or(default.intercept_paths),

            request_stage_timeout: optional_secs("HOLDPOINT_REQUEST_STAGE_TIMEOUT_SECS")
                .unwrap_or(default.request_stage_timeout),

            response_stage_timeout: optional_secs("HOLDPOINT_RESPONSE_STAGE_TIMEOUT_SECS")
                .unwrap_or(default.response_stage_timeout),

            upstream_connect_timeout: secs("HOLDPOINT_UPSTREAM_CONNECT_TIMEOUT_SECS")
                .unwrap_or(default.upstream_connect_timeout),

            upstream_request_timeout: secs("HOLDPOINT_UPSTREAM_REQUEST_TIMEOUT_SECS")
                .unwrap_or(default.upstream_request_timeout),

            req_buffer_max: std::env::var("HOLDPOINT_REQ_BUFFER_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.req_buffer_max),

            resp_buffer_max: std::env::var("HOLDPOINT_RESP_BUFFER_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.resp_buffer_max),

            terminal_grace_period: secs("HOLDPOINT_TERMINAL_GRACE_SECS")
                .unwrap_or(default.terminal_grace_period),

            eviction_interval: secs("HOLDPOINT_EVICTION_INTERVAL_SECS")
                .unwrap_or(default.eviction_interval),
        }
    }

    /// Whether requests to `path` (query string excluded) are intercepted.
    #[must_use]
    pub fn intercepts(&self, path: &str) -> bool {
        let bare = path.split('?').next().unwrap_or(path);
        self.intercept_paths.iter().any(|p| p == bare)
    }

    /// Store configuration derived from the eviction settings.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            terminal_grace_period: self.terminal_grace_period,
            eviction_interval: self.eviction_interval,
        }
    }
}

/// Reads a required-if-set duration env var expressed in seconds.
fn secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

/// Reads an optional stage deadline; `0` disables the deadline. Returns
/// `None` when the variable is unset (caller falls back to the default),
/// `Some(None)` when explicitly disabled.
fn optional_secs(var: &str) -> Option<Option<Duration>> {
    let raw = std::env::var(var).ok()?;
    let parsed: u64 = raw.parse().ok()?;
    if parsed == 0 {
        Some(None)
    } else {
        Some(Some(Duration::from_secs(parsed)))
    }
}
