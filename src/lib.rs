// =============================================================================
// exit_engine — exit-decision engine for an automated trading bot
// =============================================================================
//
// Given an open position plus live market and account data, decides whether,
// how much and at what priority to close or adjust it.
//
//   exit::ExitCoordinator       priority scheduling over exit strategies
//   exit::DynamicExitSelector   utility-scored choice among triggered ones
//   exit::TieredRrrManager      tiered reward:risk profit taking
//   signals::ConfluenceScorer   multi-indicator reversal confluence
//   loss_curve::AdaptiveLossCurve  balance-adaptive loss limit
//   exit::ExitMonitor           tick loop wiring it all to a broker
// =============================================================================

pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod exit;
pub mod loss_curve;
pub mod regime;
pub mod signals;
pub mod state;
pub mod telemetry;
pub mod types;

pub use config::EngineConfig;
pub use error::{ConfigError, ExecutionError, StrategyError, TierError};
pub use exit::{build_engine, DecisionEngine, ExitCoordinator, ExitMonitor, SelectionMode};
pub use types::{ExitAction, ExitDecision, ExitSignal, Position, Side, Ticket};
