//! Exchange lifecycle states and the transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`Exchange`](super::Exchange).
///
/// State machine:
/// - PendingRequest → Forwarding (operator released the request)
/// - PendingRequest → PendingResponse (operator supplied a synthetic
///   response, upstream is skipped)
/// - PendingRequest → Cancelled (operator aborted before the forward)
/// - Forwarding → PendingResponse (upstream replied)
/// - Forwarding → Failed (upstream call errored or timed out)
/// - PendingResponse → Completed (operator released the response)
/// - PendingResponse → Cancelled (operator aborted before the return)
/// - any non-terminal → Failed (internal error, stage timeout, shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeState {
    /// Captured and waiting for the operator to release the request.
    PendingRequest,
    /// Released; the upstream call is in flight.
    Forwarding,
    /// A response is held and waiting for the operator to release it.
    PendingResponse,
    /// The final bytes were released to the original caller.
    Completed,
    /// The exchange failed; see the exchange's `error` field for the cause.
    Failed,
    /// The operator cancelled the exchange before release.
    Cancelled,
}

impl ExchangeState {
    /// Returns true for states in which the exchange is immutable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the exchange is parked at an operator checkpoint.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingRequest | Self::PendingResponse)
    }

    /// Checks whether a transition from this state to `to` is valid.
    ///
    /// Failure is reachable from every non-terminal state so that internal
    /// errors and stage timeouts can always be recorded.
    #[must_use]
    pub fn can_transition_to(&self, to: ExchangeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == ExchangeState::Failed {
            return true;
        }
        matches!(
            (self, to),
            (ExchangeState::PendingRequest, ExchangeState::Forwarding)
                | (ExchangeState::PendingRequest, ExchangeState::PendingResponse)
                | (ExchangeState::PendingRequest, ExchangeState::Cancelled)
                | (ExchangeState::Forwarding, ExchangeState::PendingResponse)
                | (ExchangeState::PendingResponse, ExchangeState::Completed)
                | (ExchangeState::PendingResponse, ExchangeState::Cancelled)
        )
    }
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingRequest => write!(f, "pending-request"),
            Self::Forwarding => write!(f, "forwarding"),
            Self::PendingResponse => write!(f, "pending-response"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExchangeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending-request" => Ok(Self::PendingRequest),
            "forwarding" => Ok(Self::Forwarding),
            "pending-response" => Ok(Self::PendingResponse),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown exchange state '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(ExchangeState::Completed.is_terminal());
        assert!(ExchangeState::Failed.is_terminal());
        assert!(ExchangeState::Cancelled.is_terminal());
        assert!(!ExchangeState::PendingRequest.is_terminal());
        assert!(!ExchangeState::Forwarding.is_terminal());
        assert!(!ExchangeState::PendingResponse.is_terminal());
    }

    #[test]
    fn valid_transitions() {
        use ExchangeState::*;
        assert!(PendingRequest.can_transition_to(Forwarding));
        assert!(PendingRequest.can_transition_to(PendingResponse));
        assert!(PendingRequest.can_transition_to(Cancelled));
        assert!(Forwarding.can_transition_to(PendingResponse));
        assert!(PendingResponse.can_transition_to(Completed));
        assert!(PendingResponse.can_transition_to(Cancelled));
    }

    #[test]
    fn failure_reachable_from_any_non_terminal() {
        use ExchangeState::*;
        for from in [PendingRequest, Forwarding, PendingResponse] {
            assert!(from.can_transition_to(Failed), "{from} -> Failed");
        }
    }

    #[test]
    fn invalid_transitions() {
        use ExchangeState::*;
        // Forwarding is not retractable.
        assert!(!Forwarding.can_transition_to(Cancelled));
        assert!(!Forwarding.can_transition_to(PendingRequest));
        // No skipping straight to completion.
        assert!(!PendingRequest.can_transition_to(Completed));
        // Terminal states are immutable, even towards Failed.
        for from in [Completed, Failed, Cancelled] {
            for to in [
                PendingRequest,
                Forwarding,
                PendingResponse,
                Completed,
                Failed,
                Cancelled,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn display_round_trips_through_from_str() {
        use ExchangeState::*;
        for state in [
            PendingRequest,
            Forwarding,
            PendingResponse,
            Completed,
            Failed,
            Cancelled,
        ] {
            let parsed: ExchangeState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<ExchangeState>().is_err());
    }
}
