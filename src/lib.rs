//! Holdpoint - an intercepting proxy for OpenAI-compatible APIs.
//!
//! Holdpoint sits between a client and an OpenAI-compatible server and
//! suspends each intercepted call at two checkpoints: once before the
//! request is forwarded upstream, and once before the response is returned
//! to the caller. While a call is suspended, an operator can inspect the
//! in-flight payload through the control API, edit it, fabricate a
//! response without contacting upstream, or cancel the call outright.
//!
//! # Architecture
//!
//! - [`exchange`] - the in-flight exchange store: state machine, captured
//!   payloads, and the per-exchange release gate.
//! - [`relay`] - the upstream HTTP client that performs the actual forward.
//! - [`proxy`] - the inbound serving path (capture, pause, forward, pause,
//!   reply) plus transparent passthrough for non-intercepted routes.
//! - [`control`] - the operator-facing HTTP API (list, edit, release,
//!   cancel) served on a dedicated port.
//! - [`synthetic`] - helpers for fabricating OpenAI-style chat completion
//!   payloads.

pub mod config;
pub mod control;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod synthetic;
