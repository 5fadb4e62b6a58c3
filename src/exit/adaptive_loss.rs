// =============================================================================
// AdaptiveLossExit — per-trade loss limit from the account-size loss curve
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::StrategyError;
use crate::loss_curve::AdaptiveLossCurve;
use crate::state::StrategyScope;
use crate::types::ExitSignal;

fn default_priority() -> u8 {
    88
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveLossExitConfig {
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl Default for AdaptiveLossExitConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
        }
    }
}

pub struct AdaptiveLossExit {
    curve: Arc<AdaptiveLossCurve>,
    config: AdaptiveLossExitConfig,
}

impl AdaptiveLossExit {
    pub fn new(curve: Arc<AdaptiveLossCurve>, config: AdaptiveLossExitConfig) -> Self {
        Self { curve, config }
    }

    pub fn curve(&self) -> &Arc<AdaptiveLossCurve> {
        &self.curve
    }
}

impl ExitStrategy for AdaptiveLossExit {
    fn name(&self) -> &str {
        "adaptive_loss"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::AdaptiveLoss
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let balance = ctx.account.balance;
        if balance <= 0.0 {
            return Ok(None);
        }
        let (close, reason) = self.curve.should_close_for_loss(balance, ctx.position_ctx.unrealized_pnl);
        if !close {
            return Ok(None);
        }

        info!(
            ticket = ctx.position.ticket,
            balance = format!("{:.2}", balance),
            pnl = format!("{:.2}", ctx.position_ctx.unrealized_pnl),
            "Adaptive loss limit hit"
        );
        Ok(Some(
            ExitSignal::close(ctx.position.ticket, self.name(), reason, self.config.priority)
                .with_exit_price(ctx.position.current_price)
                .at(ctx.now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::fixtures::{position, Harness};
    use crate::loss_curve::LossCurveConfig;
    use crate::telemetry::null_sink;
    use crate::types::Side;

    fn strategy() -> AdaptiveLossExit {
        let curve = Arc::new(AdaptiveLossCurve::new(LossCurveConfig::default(), null_sink()).unwrap());
        AdaptiveLossExit::new(curve, AdaptiveLossExitConfig::default())
    }

    #[test]
    fn closes_once_loss_reaches_the_curve_limit() {
        let strategy = strategy();
        let mut h = Harness::new(position(Side::Long, 100.0));
        h.account.balance = 10_000.0;
        let limit = strategy.curve().get_max_loss(10_000.0, true);

        // 100 lots: one price unit is 100 of P&L
        h.position.volume = 100.0;
        h.set_price(100.0 - limit * 0.5 / 100.0);
        assert!(h.run(&strategy).is_none());

        h.set_price(100.0 - limit * 1.01 / 100.0);
        let signal = h.run(&strategy).unwrap();
        assert_eq!(signal.priority, 88);
        assert!(signal.reason.contains("adaptive limit"));
    }

    #[test]
    fn winners_and_unknown_balance_are_ignored() {
        let strategy = strategy();
        let mut h = Harness::new(position(Side::Long, 105.0));
        assert!(h.run(&strategy).is_none());
        h.set_price(0.5);
        h.account.balance = 0.0;
        assert!(h.run(&strategy).is_none());
    }
}
