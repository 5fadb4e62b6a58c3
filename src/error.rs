// =============================================================================
// Error taxonomy for the exit engine
// =============================================================================
//
//   ConfigError    — invalid thresholds / weights; raised at construction only.
//   StrategyError  — a single strategy failed; the coordinator logs it and
//                    treats it as "no signal".
//   TierError      — misuse of the tiered RRR state machine (unknown ticket,
//                    confirming a tier that is not in flight, ...).
//   ExecutionError — dispatch-side failures (in-flight suppression, closed
//                    queue, timeouts).
// =============================================================================

use thiserror::Error;

use crate::types::Ticket;

/// Invalid configuration detected while building a component.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("weights for {component} must be non-negative and sum to a positive value")]
    Weights { component: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Return `Err(ConfigError::Invalid)` unless `condition` holds.
pub fn ensure(condition: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, reason))
    }
}

/// Failure inside a single strategy evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("strategy `{strategy}`: state namespace holds a value of another type")]
    StateType { strategy: String },

    #[error("strategy `{strategy}`: {reason}")]
    Evaluation { strategy: String, reason: String },

    #[error(transparent)]
    Tier(#[from] TierError),
}

/// Misuse of the tiered reward:risk state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TierError {
    #[error("ticket {0} is not registered")]
    UnknownTicket(Ticket),

    #[error("ticket {ticket} has no tier {tier}")]
    UnknownTier { ticket: Ticket, tier: usize },

    #[error("tier {tier} of ticket {ticket} has no close in flight")]
    NotPending { ticket: Ticket, tier: usize },

    #[error("cannot register ticket {ticket}: {reason}")]
    Registration { ticket: Ticket, reason: String },
}

/// Failure on the execution side of a decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("ticket {0} already has a close in flight")]
    InFlight(Ticket),

    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error("request for ticket {ticket} timed out after {millis}ms")]
    Timeout { ticket: Ticket, millis: u64 },

    #[error("ticket {0} is no longer open")]
    PositionGone(Ticket),
}
