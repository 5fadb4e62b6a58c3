// =============================================================================
// Exit Management Module
// =============================================================================
//
// Exit strategies, the two decision front ends (priority coordinator and
// utility selector), the tiered RRR state machine and the monitor loop that
// drives them against a market feed and an execution engine.
// =============================================================================

pub mod adaptive_loss;
pub mod confluence_exit;
pub mod coordinator;
pub mod micro_account;
pub mod monitor;
pub mod profit_scaling;
pub mod selector;
pub mod stop_loss;
pub mod strategy;
pub mod thresholds;
pub mod tiered_exit;
pub mod tiered_rrr;
pub mod trailing_stop;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use adaptive_loss::{AdaptiveLossExit, AdaptiveLossExitConfig};
pub use confluence_exit::{ConfluenceExit, ConfluenceExitConfig};
pub use coordinator::{ExitCoordinator, PriorityRules};
pub use micro_account::{MicroAccountConfig, MicroAccountProtection, SurvivalConfig, SurvivalMode};
pub use monitor::{ExitMonitor, MonitorConfig, TickSummary};
pub use profit_scaling::{ProfitScaling, ProfitScalingConfig};
pub use selector::{DynamicExitSelector, SelectorConfig, UtilityWeights};
pub use stop_loss::{StopLevel, StopLoss, StopLossConfig};
pub use strategy::{EvalContext, ExitStrategy, ExitStyle, StrategyKind};
pub use thresholds::{
    AdverseMovement, AdverseMovementConfig, ProfitTarget, ProfitTargetConfig, TimeBased, TimeBasedConfig,
};
pub use tiered_exit::TieredRrrExit;
pub use tiered_rrr::{PositionExitState, RrrTarget, TieredRrrConfig, TieredRrrManager};
pub use trailing_stop::{TrailMode, TrailingStop, TrailingStopConfig};

use crate::config::EngineConfig;
use crate::context::{MarketContext, PositionContext};
use crate::error::ConfigError;
use crate::execution::CloseResult;
use crate::loss_curve::AdaptiveLossCurve;
use crate::regime::MarketRegime;
use crate::telemetry::SharedSink;
use crate::types::{ExitDecision, MarketData, Position, Ticket};

// =============================================================================
// SelectionMode / DecisionEngine
// =============================================================================

/// Which front end picks the exit each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Coordinator,
    Selector,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => write!(f, "COORDINATOR"),
            Self::Selector => write!(f, "SELECTOR"),
        }
    }
}

/// The configured decision front end.
#[derive(Debug)]
pub enum DecisionEngine {
    Coordinator(ExitCoordinator),
    Selector(DynamicExitSelector),
}

impl DecisionEngine {
    pub fn mode(&self) -> SelectionMode {
        match self {
            Self::Coordinator(_) => SelectionMode::Coordinator,
            Self::Selector(_) => SelectionMode::Selector,
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn ExitStrategy>) -> Result<(), ConfigError> {
        match self {
            Self::Coordinator(c) => c.register(strategy),
            Self::Selector(s) => s.register(strategy),
        }
    }

    pub fn strategies(&self) -> &[Arc<dyn ExitStrategy>] {
        match self {
            Self::Coordinator(c) => c.strategies(),
            Self::Selector(s) => s.strategies(),
        }
    }

    pub fn observe(&self, position: &Position, now: DateTime<Utc>) -> PositionContext {
        match self {
            Self::Coordinator(c) => c.observe(position, now),
            Self::Selector(s) => s.observe(position, now),
        }
    }

    /// One decision for `position`, with the regime the selector scored it
    /// under (the coordinator does not classify).
    pub fn decide(
        &self,
        position: &Position,
        market: &MarketContext,
        position_ctx: &PositionContext,
        data: &MarketData,
    ) -> Option<(ExitDecision, Option<MarketRegime>)> {
        match self {
            Self::Coordinator(c) => c.evaluate(position, market, position_ctx, data).map(|d| (d, None)),
            Self::Selector(s) => {
                let regime = s.regime(market);
                s.select(position, market, position_ctx, data).map(|d| (d, Some(regime)))
            }
        }
    }

    pub fn record_outcome(&self, decision: &ExitDecision, result: &CloseResult, regime: Option<MarketRegime>) {
        match (self, regime) {
            (Self::Coordinator(c), _) => c.record_outcome(decision, result),
            (Self::Selector(s), Some(regime)) => s.record_outcome(decision, result, regime),
            (Self::Selector(s), None) => s.record_outcome(decision, result, MarketRegime::Ranging),
        }
    }

    pub fn unregister(&self, ticket: Ticket) -> bool {
        match self {
            Self::Coordinator(c) => c.unregister(ticket),
            Self::Selector(s) => s.unregister(ticket),
        }
    }

    pub fn retain_open(&self, open: &HashSet<Ticket>) -> Vec<Ticket> {
        match self {
            Self::Coordinator(c) => c.retain_open(open),
            Self::Selector(s) => s.retain_open(open),
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// A wired decision engine plus the shared components the monitor needs.
#[derive(Debug)]
pub struct EngineParts {
    pub engine: DecisionEngine,
    pub tiers: Option<Arc<TieredRrrManager>>,
    pub loss_curve: Arc<AdaptiveLossCurve>,
}

/// Build the configured front end and register every enabled strategy.
///
/// Registration order doubles as the coordinator's tie-break order, so the
/// account-level guards come first.
pub fn build_engine(config: &EngineConfig, sink: SharedSink) -> Result<EngineParts, ConfigError> {
    config.validate()?;
    let s = &config.strategies;

    let mut engine = match config.selection {
        SelectionMode::Coordinator => {
            DecisionEngine::Coordinator(ExitCoordinator::new(config.priority.clone(), Arc::clone(&sink))?)
        }
        SelectionMode::Selector => {
            DecisionEngine::Selector(DynamicExitSelector::new(config.selector.clone(), Arc::clone(&sink))?)
        }
    };

    let loss_curve = Arc::new(AdaptiveLossCurve::new(config.loss_curve.clone(), Arc::clone(&sink))?);

    if let Some(c) = &s.survival {
        engine.register(Arc::new(SurvivalMode::new(c.clone())?))?;
    }
    if let Some(c) = &s.micro_account {
        engine.register(Arc::new(MicroAccountProtection::new(c.clone())?))?;
    }
    if let Some(c) = &s.adaptive_loss {
        engine.register(Arc::new(AdaptiveLossExit::new(Arc::clone(&loss_curve), c.clone())))?;
    }
    if let Some(c) = &s.stop_loss {
        engine.register(Arc::new(StopLoss::new(c.clone())?))?;
    }
    if let Some(c) = &s.trailing_stop {
        engine.register(Arc::new(TrailingStop::new(c.clone())?))?;
    }
    if let Some(c) = &s.adverse_movement {
        engine.register(Arc::new(AdverseMovement::new(c.clone())?))?;
    }
    if let Some(c) = &s.confluence {
        engine.register(Arc::new(ConfluenceExit::new(c.clone())?))?;
    }

    let tiers = if s.tiered_rrr.enabled {
        let manager = Arc::new(TieredRrrManager::new(s.tiered_rrr.clone(), Arc::clone(&sink))?);
        engine.register(Arc::new(TieredRrrExit::new(Arc::clone(&manager))))?;
        Some(manager)
    } else {
        None
    };

    if let Some(c) = &s.profit_scaling {
        engine.register(Arc::new(ProfitScaling::new(c.clone())?))?;
    }
    if let Some(c) = &s.profit_target {
        engine.register(Arc::new(ProfitTarget::new(c.clone())?))?;
    }
    if let Some(c) = &s.time_based {
        engine.register(Arc::new(TimeBased::new(c.clone())?))?;
    }

    info!(
        mode = %engine.mode(),
        strategies = ?engine.strategies().iter().map(|s| s.name()).collect::<Vec<_>>(),
        tiers = tiers.is_some(),
        "Exit engine built"
    );

    Ok(EngineParts {
        engine,
        tiers,
        loss_curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::null_sink;

    #[test]
    fn default_config_builds_a_coordinator() {
        let parts = build_engine(&EngineConfig::default(), null_sink()).unwrap();
        assert_eq!(parts.engine.mode(), SelectionMode::Coordinator);
        assert!(parts.tiers.is_some());
        let names: Vec<_> = parts.engine.strategies().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names.first().map(String::as_str), Some("survival"));
        assert!(names.iter().any(|n| n == "tiered_rrr"));
        assert!(!names.iter().any(|n| n == "profit_scaling"), "scaling is opt-in");
    }

    #[test]
    fn selector_mode_and_disabled_strategies() {
        let mut config = EngineConfig {
            selection: SelectionMode::Selector,
            ..Default::default()
        };
        config.strategies.confluence = None;
        config.strategies.tiered_rrr.enabled = false;
        let parts = build_engine(&config, null_sink()).unwrap();
        assert_eq!(parts.engine.mode(), SelectionMode::Selector);
        assert!(parts.tiers.is_none());
        assert!(!parts.engine.strategies().iter().any(|s| s.name() == "confluence"));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut config = EngineConfig::default();
        config.selector.min_utility = 2.0;
        assert!(build_engine(&config, null_sink()).is_err());
    }
}
