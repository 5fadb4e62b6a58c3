// =============================================================================
// Execution layer — contracts to the broker and the position tracker, plus
// the in-flight registry, dispatch worker and stop-modify retry built on them
// =============================================================================
//
// Nothing in here is called from inside strategy evaluation. The monitor
// converts decisions into ExitActions and hands them to the Dispatcher, which
// owns the only task that talks to the ExecutionEngine.
// =============================================================================

pub mod dispatcher;
pub mod in_flight;
pub mod paper;
pub mod retry;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::MarketContext;
use crate::types::{AccountSnapshot, IndicatorSnapshot, Position, Ticket};

pub use dispatcher::{ActionOutcome, DispatchConfig, Dispatcher};
pub use in_flight::{InFlightGuard, InFlightRegistry};
pub use paper::PaperBroker;
pub use retry::{modify_stop_with_retry, RetryPolicy};

// =============================================================================
// CloseResult
// =============================================================================

/// Broker-side status of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    Filled,
    PartiallyFilled,
    Rejected,
    Failed,
    TimedOut,
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Outcome of a close request as reported by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub status: CloseStatus,
    /// Lots actually closed.
    pub filled_volume: f64,
    /// Realized profit of the filled part, in account currency.
    pub profit: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl CloseResult {
    pub fn filled(volume: f64, profit: f64) -> Self {
        Self {
            status: CloseStatus::Filled,
            filled_volume: volume,
            profit,
            error: None,
        }
    }

    pub fn partially_filled(volume: f64, profit: f64) -> Self {
        Self {
            status: CloseStatus::PartiallyFilled,
            filled_volume: volume,
            profit,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CloseStatus::Failed,
            filled_volume: 0.0,
            profit: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: CloseStatus::Rejected,
            ..Self::failed(error)
        }
    }

    pub fn timed_out(millis: u64) -> Self {
        Self {
            status: CloseStatus::TimedOut,
            ..Self::failed(format!("no response after {millis}ms"))
        }
    }

    /// At least part of the requested volume was closed.
    pub fn is_success(&self) -> bool {
        matches!(self.status, CloseStatus::Filled | CloseStatus::PartiallyFilled) && self.filled_volume > 0.0
    }
}

// =============================================================================
// External contracts
// =============================================================================

/// The broker connector. Implemented outside this crate (and by PaperBroker).
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Close `volume` lots of `ticket`, or the whole position when `None`.
    async fn close_position(&self, ticket: Ticket, volume: Option<f64>) -> CloseResult;

    /// Move the protective stop. Returns whether the broker accepted it.
    async fn modify_stop_loss(&self, ticket: Ticket, new_stop_loss: f64) -> bool;
}

/// The position tracker, account layer and indicator layer as one feed.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn open_positions(&self) -> Vec<Position>;

    async fn position(&self, ticket: Ticket) -> Option<Position> {
        self.open_positions().await.into_iter().find(|p| p.ticket == ticket)
    }

    async fn account(&self) -> AccountSnapshot;

    async fn indicators(&self, symbol: &str) -> IndicatorSnapshot;

    /// Market context for `symbol`. The default derives it from indicators
    /// with no spread, news or session-close information.
    async fn market_context(&self, _symbol: &str, indicators: &IndicatorSnapshot) -> MarketContext {
        MarketContext::from_indicators(indicators, 0.0, Utc::now())
    }
}
