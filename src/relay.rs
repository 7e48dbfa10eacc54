//! Upstream HTTP relay with connection pooling.
//!
//! Forwards a captured (possibly operator-edited) request to the upstream
//! OpenAI-compatible server and captures the response verbatim. The relay
//! is deliberately one-shot: no automatic retry, because a released request
//! may carry side effects and the operator has already signed off on
//! sending it exactly once.
//!
//! # Error Classification
//!
//! - Timeout errors become [`GateError::UpstreamTimeout`]
//! - Connection errors become [`GateError::UpstreamConnectionFailed`]
//! - Everything else becomes [`GateError::UpstreamFailed`]
//!
//! # Security
//!
//! - TLS certificate verification is enabled by default
//! - Hop-by-hop headers are stripped in both directions

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error, warn};

use crate::error::GateError;
use crate::exchange::{CapturedRequest, CapturedResponse, PayloadBody};
use crate::metrics::Metrics;

/// Configuration for the upstream relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the upstream server, e.g. `https://api.openai.com/v1`.
    /// Captured request paths are joined onto the host portion unchanged,
    /// so the base's own path (if any) is ignored beyond scheme/authority
    /// when the captured path is absolute.
    pub base_url: String,
    /// Request timeout (includes connection + response).
    pub timeout: Duration,
    /// Connection timeout (TCP + TLS handshake).
    pub connect_timeout: Duration,
    /// Maximum idle connections per host.
    pub pool_max_idle_per_host: usize,
    /// Idle connection timeout.
    pub pool_idle_timeout: Duration,
    /// Maximum response body size in bytes. Prevents unbounded memory
    /// allocation from oversized upstream responses.
    pub max_response_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            max_response_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl RelayConfig {
    /// Create a new config with the specified base URL and default values
    /// for all other settings.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// Upstream relay client.
///
/// # Thread Safety
///
/// The relay is `Clone` and can be shared across tasks. The underlying
/// reqwest client handles connection pooling internally.
#[derive(Clone)]
pub struct Relay {
    client: Client,
    config: RelayConfig,
    /// Scheme + authority of `base_url`, pre-computed so absolute captured
    /// paths can be joined without per-request URL surgery.
    origin: String,
    metrics: Option<Arc<Metrics>>,
}

impl Relay {
    /// Create a new relay.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Internal`] if the base URL is empty or not a
    /// valid absolute URL, or if the HTTP client cannot be built.
    pub fn new(config: RelayConfig) -> Result<Self, GateError> {
        if config.base_url.is_empty() {
            return Err(GateError::Internal {
                details: "relay base_url is empty".to_string(),
            });
        }

        let parsed = reqwest::Url::parse(&config.base_url).map_err(|e| GateError::Internal {
            details: format!("invalid relay base_url '{}': {}", config.base_url, e),
        })?;

        let origin = match parsed.port() {
            Some(port) => format!(
                "{}://{}:{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default(),
                port
            ),
            None => format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            ),
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| GateError::Internal {
                details: format!("relay client build error: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            origin,
            metrics: None,
        })
    }

    /// Add metrics to this relay, enabling upstream request counting.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Forward a captured request to upstream and capture the response.
    ///
    /// The captured path (including query string) is joined onto the
    /// upstream origin; hop-by-hop headers and `host` are stripped before
    /// sending, and again from the captured response. The body is sent byte
    /// for byte.
    ///
    /// # Errors
    ///
    /// - [`GateError::UpstreamTimeout`] if the request times out
    /// - [`GateError::UpstreamConnectionFailed`] if the connection fails
    /// - [`GateError::UpstreamFailed`] for other transport failures,
    ///   including an oversized response body
    ///
    /// Upstream HTTP error statuses (4xx/5xx) are NOT errors here: they are
    /// captured like any other response so the operator can inspect them.
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn forward(&self, request: &CapturedRequest) -> Result<CapturedResponse, GateError> {
        let url = self.join_url(&request.path);

        debug!(
            method = %request.method,
            url = %url,
            body_bytes = request.body.len(),
            "Forwarding request to upstream"
        );

        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            GateError::Internal {
                details: format!("invalid captured method '{}': {}", request.method, e),
            }
        })?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if is_hop_by_hop_header(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            // content-length is recomputed from the (possibly edited) body
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name, value);
        }

        let result = builder.body(request.body.as_bytes().clone()).send().await;
        let response = match result {
            Ok(response) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_upstream(true);
                }
                response
            }
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_upstream(false);
                }
                return Err(self.classify_error(e));
            }
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop_header(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = self.read_body_limited(response).await?;

        debug!(
            status = status,
            body_bytes = body.len(),
            "Captured upstream response"
        );

        Ok(CapturedResponse {
            status,
            headers,
            body: PayloadBody::from_bytes(body),
        })
    }

    /// Joins a captured path (already includes any query string) onto the
    /// upstream origin.
    fn join_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.origin, path)
        } else {
            format!("{}/{}", self.origin, path)
        }
    }

    /// Read the response body with a size limit.
    ///
    /// Checks `Content-Length` first for early rejection, then streams the
    /// body chunk-by-chunk with size enforcement so chunked responses
    /// without a `Content-Length` cannot grow unbounded.
    async fn read_body_limited(
        &self,
        response: reqwest::Response,
    ) -> Result<bytes::Bytes, GateError> {
        let max_size = self.config.max_response_size;

        if let Some(content_length) = response.content_length() {
            if content_length as usize > max_size {
                warn!(
                    content_length = content_length,
                    max_response_size = max_size,
                    "Upstream response exceeds size limit (Content-Length)"
                );
                return Err(GateError::UpstreamFailed {
                    reason: format!(
                        "upstream response too large: {content_length} bytes exceeds {max_size} byte limit"
                    ),
                });
            }
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|cl| cl as usize)
                .unwrap_or(8192)
                .min(max_size),
        );

        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            error!(error = %e, "Failed to read upstream response body chunk");
            GateError::UpstreamFailed {
                reason: format!("failed to read upstream response: {e}"),
            }
        })? {
            if buf.len() + chunk.len() > max_size {
                warn!(
                    accumulated = buf.len(),
                    chunk_size = chunk.len(),
                    max_response_size = max_size,
                    "Upstream response exceeds size limit during streaming"
                );
                return Err(GateError::UpstreamFailed {
                    reason: format!(
                        "upstream response too large: >={} bytes exceeds {} byte limit",
                        buf.len() + chunk.len(),
                        max_size
                    ),
                });
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(buf.into())
    }

    /// Classify a reqwest error into a [`GateError`].
    fn classify_error(&self, error: reqwest::Error) -> GateError {
        if error.is_timeout() {
            warn!(
                timeout_secs = self.config.timeout.as_secs(),
                url = %self.config.base_url,
                "Upstream request timed out"
            );
            GateError::UpstreamTimeout {
                url: self.config.base_url.clone(),
                timeout_secs: self.config.timeout.as_secs(),
            }
        } else if error.is_connect() {
            warn!(
                url = %self.config.base_url,
                "Failed to connect to upstream"
            );
            GateError::UpstreamConnectionFailed {
                url: self.config.base_url.clone(),
                reason: error.to_string(),
            }
        } else {
            error!(error = %error, "Upstream request failed");
            GateError::UpstreamFailed {
                reason: error.to_string(),
            }
        }
    }
}

/// Whether a header is hop-by-hop per RFC 9110 §7.6.1 and must not be
/// forwarded through the proxy.
pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
