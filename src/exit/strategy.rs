// =============================================================================
// ExitStrategy — the polymorphic unit the coordinator and selector schedule
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{MarketContext, PositionContext};
use crate::error::StrategyError;
use crate::execution::CloseResult;
use crate::state::StrategyScope;
use crate::types::{AccountSnapshot, ExitSignal, IndicatorSnapshot, Position};

/// Which family a strategy belongs to. Priority adjustment rules target
/// families, not names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    StopLoss,
    TrailingStop,
    TimeBased,
    ProfitTarget,
    AdverseMovement,
    MicroAccountProtection,
    SurvivalMode,
    AdaptiveLoss,
    Confluence,
    ProfitScaling,
    TieredRrr,
}

impl StrategyKind {
    pub fn is_stop_like(self) -> bool {
        matches!(self, Self::StopLoss | Self::TrailingStop | Self::AdaptiveLoss)
    }

    pub fn is_adverse_like(self) -> bool {
        matches!(self, Self::AdverseMovement)
    }

    pub fn is_profit_target_like(self) -> bool {
        matches!(self, Self::ProfitTarget | Self::ProfitScaling | Self::TieredRrr)
    }

    pub fn is_time_based(self) -> bool {
        matches!(self, Self::TimeBased)
    }

    pub fn style(self) -> ExitStyle {
        match self {
            Self::StopLoss | Self::AdverseMovement | Self::SurvivalMode | Self::AdaptiveLoss => ExitStyle::LossCut,
            Self::TrailingStop | Self::MicroAccountProtection => ExitStyle::Protective,
            Self::ProfitTarget | Self::ProfitScaling | Self::TieredRrr => ExitStyle::ProfitTake,
            Self::TimeBased => ExitStyle::Timing,
            Self::Confluence => ExitStyle::Signal,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StopLoss => "STOP_LOSS",
            Self::TrailingStop => "TRAILING_STOP",
            Self::TimeBased => "TIME_BASED",
            Self::ProfitTarget => "PROFIT_TARGET",
            Self::AdverseMovement => "ADVERSE_MOVEMENT",
            Self::MicroAccountProtection => "MICRO_ACCOUNT",
            Self::SurvivalMode => "SURVIVAL",
            Self::AdaptiveLoss => "ADAPTIVE_LOSS",
            Self::Confluence => "CONFLUENCE",
            Self::ProfitScaling => "PROFIT_SCALING",
            Self::TieredRrr => "TIERED_RRR",
        };
        write!(f, "{name}")
    }
}

/// Coarse behavioural style, used by the selector's regime affinity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitStyle {
    /// Cuts a losing or endangered position.
    LossCut,
    /// Protects open profit (trailing, locks).
    Protective,
    /// Banks profit at targets.
    ProfitTake,
    /// Exits on elapsed time or session events.
    Timing,
    /// Exits on indicator reversal evidence.
    Signal,
}

/// Everything a strategy may read for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub position: &'a Position,
    pub market: &'a MarketContext,
    pub position_ctx: &'a PositionContext,
    pub indicators: &'a IndicatorSnapshot,
    pub account: &'a AccountSnapshot,
    pub now: DateTime<Utc>,
}

/// One exit rule.
///
/// Implementations must be cheap and side-effect free apart from their own
/// per-ticket slot (`scope`) and internal locks; no order calls.
pub trait ExitStrategy: Send + Sync {
    /// Unique name; also the strategy's state namespace.
    fn name(&self) -> &str;

    fn kind(&self) -> StrategyKind;

    fn base_priority(&self) -> u8;

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError>;

    /// Execution feedback for a signal this strategy produced.
    fn on_outcome(
        &self,
        _signal: &ExitSignal,
        _result: &CloseResult,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    /// The signal triggered but another one won this tick. Strategies that
    /// reserve state when signalling (pending tiers) release it here.
    fn on_superseded(&self, _signal: &ExitSignal, _scope: &mut StrategyScope<'_>) -> Result<(), StrategyError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ExitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitStrategy")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("base_priority", &self.base_priority())
            .finish()
    }
}

/// Shared test fixtures for strategy modules.
#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::context::PeakTracker;
    use crate::state::TicketEntry;
    use crate::types::Side;

    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    /// 1-lot position opened 30 minutes ago with entry 100 and stop 98.
    pub fn position(side: Side, price: f64) -> Position {
        let pnl = side.favorable_move(100.0, price);
        Position {
            ticket: 1,
            symbol: "EURUSD".into(),
            side,
            entry_price: 100.0,
            current_price: price,
            volume: 1.0,
            unrealized_pnl: pnl,
            stop_loss: Some(side.offset_adverse(100.0, 2.0)),
            take_profit: None,
            opened_at: now() - Duration::minutes(30),
            peak_favorable: pnl.max(0.0),
            peak_adverse: (-pnl).max(0.0),
        }
    }

    /// Owned inputs for one evaluation, with a helper to borrow an EvalContext.
    pub struct Harness {
        pub position: Position,
        pub market: MarketContext,
        pub peak: PeakTracker,
        pub indicators: IndicatorSnapshot,
        pub account: AccountSnapshot,
        pub entry: TicketEntry,
        pub now: DateTime<Utc>,
    }

    impl Harness {
        pub fn new(position: Position) -> Self {
            let mut peak = PeakTracker::default();
            peak.observe(&position);
            Self {
                position,
                market: MarketContext::default(),
                peak,
                indicators: IndicatorSnapshot::new(),
                account: AccountSnapshot {
                    balance: 10_000.0,
                    equity: 10_000.0,
                    margin_level: None,
                    drawdown_pct: 0.0,
                },
                entry: TicketEntry::default(),
                now: now(),
            }
        }

        /// Move price, updating P&L and the peak tracker.
        pub fn set_price(&mut self, price: f64) {
            let pnl = self.position.side.favorable_move(self.position.entry_price, price) * self.position.volume;
            self.position.current_price = price;
            self.position.unrealized_pnl = pnl;
            self.position.peak_favorable = self.position.peak_favorable.max(pnl);
            self.position.peak_adverse = self.position.peak_adverse.max(-pnl);
            self.peak.observe(&self.position);
        }

        pub fn run(&mut self, strategy: &dyn ExitStrategy) -> Option<ExitSignal> {
            let position_ctx = PositionContext::derive(&self.position, &self.peak, self.now);
            let ctx = EvalContext {
                position: &self.position,
                market: &self.market,
                position_ctx: &position_ctx,
                indicators: &self.indicators,
                account: &self.account,
                now: self.now,
            };
            let name = strategy.name().to_string();
            let mut scope = self.entry.scope(&name);
            strategy.should_exit(&ctx, &mut scope).unwrap()
        }

        pub fn feedback(&mut self, strategy: &dyn ExitStrategy, signal: &ExitSignal, result: &CloseResult) {
            let name = strategy.name().to_string();
            let mut scope = self.entry.scope(&name);
            strategy.on_outcome(signal, result, &mut scope).unwrap();
        }

        pub fn supersede(&mut self, strategy: &dyn ExitStrategy, signal: &ExitSignal) {
            let name = strategy.name().to_string();
            let mut scope = self.entry.scope(&name);
            strategy.on_superseded(signal, &mut scope).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_groupings() {
        assert!(StrategyKind::TrailingStop.is_stop_like());
        assert!(StrategyKind::AdaptiveLoss.is_stop_like());
        assert!(!StrategyKind::AdverseMovement.is_stop_like());
        assert!(StrategyKind::TieredRrr.is_profit_target_like());
        assert_eq!(StrategyKind::Confluence.style(), ExitStyle::Signal);
        assert_eq!(StrategyKind::SurvivalMode.style(), ExitStyle::LossCut);
    }
}
