//! In-flight exchange tracking: data model, state machine, and store.
//!
//! An [`Exchange`] represents one proxied call end-to-end. The
//! [`ExchangeStore`] is the single source of truth consulted by both the
//! serving path and the control API; it also owns the per-exchange release
//! gate that suspends the serving task until the operator acts.

pub mod error;
pub mod state;
pub mod store;
pub mod types;

pub use error::ExchangeError;
pub use state::ExchangeState;
pub use store::{ExchangeStore, StoreConfig, WaitError};
pub use types::{
    CapturedRequest, CapturedResponse, Exchange, ExchangeId, FailureCause, FailureKind,
    PayloadBody, Stage,
};
