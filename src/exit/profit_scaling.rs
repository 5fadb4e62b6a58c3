// =============================================================================
// ProfitScaling — profit-% tiers scaled to account, volatility and momentum
// =============================================================================
//
// Target i (percent of entry) = base_i × account × volatility × momentum:
//
//   account    < small_account → 0.7, ≥ large_account → 1.2, else 1.0
//   volatility clamp(volatility / reference, 0.5, 2.0), 1.0 when unknown
//   momentum   trend aligned > 0.5 → 1.3 (let it run),
//              trend against < −0.3 → 0.8 (bank sooner)
//
// Tiers fire in order, one in flight at a time; the last tier closes the
// remainder. Once profit has reached the first target, a retrace of more
// than givebacks[tiers_taken] of the peak closes everything that is left.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::execution::CloseResult;
use crate::state::StrategyScope;
use crate::types::{round_lots, ExitSignal, LotSpec};

fn default_base_targets_pct() -> Vec<f64> {
    vec![0.5, 1.0, 2.0]
}
fn default_close_fractions() -> Vec<f64> {
    vec![0.3, 0.3, 0.4]
}
fn default_givebacks() -> Vec<f64> {
    vec![0.7, 0.55, 0.4]
}
fn default_small_account() -> f64 {
    500.0
}
fn default_large_account() -> f64 {
    5000.0
}
fn default_volatility_reference() -> f64 {
    0.5
}
fn default_priority() -> u8 {
    55
}
fn default_giveback_priority() -> u8 {
    65
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitScalingConfig {
    #[serde(default = "default_base_targets_pct")]
    pub base_targets_pct: Vec<f64>,
    /// Fraction of the initial volume per tier.
    #[serde(default = "default_close_fractions")]
    pub close_fractions: Vec<f64>,
    /// Allowed retrace of peak profit, indexed by tiers already taken.
    #[serde(default = "default_givebacks")]
    pub givebacks: Vec<f64>,
    #[serde(default = "default_small_account")]
    pub small_account: f64,
    #[serde(default = "default_large_account")]
    pub large_account: f64,
    /// Volatility (ATR % of price) treated as normal.
    #[serde(default = "default_volatility_reference")]
    pub volatility_reference: f64,
    #[serde(default)]
    pub lots: LotSpec,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_giveback_priority")]
    pub giveback_priority: u8,
}

impl Default for ProfitScalingConfig {
    fn default() -> Self {
        Self {
            base_targets_pct: default_base_targets_pct(),
            close_fractions: default_close_fractions(),
            givebacks: default_givebacks(),
            small_account: default_small_account(),
            large_account: default_large_account(),
            volatility_reference: default_volatility_reference(),
            lots: LotSpec::default(),
            priority: default_priority(),
            giveback_priority: default_giveback_priority(),
        }
    }
}

impl ProfitScalingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.base_targets_pct.len();
        ensure(n > 0, "profit_scaling.base_targets_pct", "need at least one tier")?;
        ensure(
            self.base_targets_pct.windows(2).all(|w| w[1] > w[0]) && self.base_targets_pct[0] > 0.0,
            "profit_scaling.base_targets_pct",
            "must be positive and ascending",
        )?;
        ensure(
            self.close_fractions.len() == n,
            "profit_scaling.close_fractions",
            "need one fraction per tier",
        )?;
        let sum: f64 = self.close_fractions.iter().sum();
        if self.close_fractions.iter().any(|f| *f <= 0.0) || (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Weights {
                component: "profit_scaling.close_fractions".into(),
            });
        }
        ensure(
            !self.givebacks.is_empty() && self.givebacks.iter().all(|g| *g > 0.0 && *g <= 1.0),
            "profit_scaling.givebacks",
            "must be non-empty, each in (0, 1]",
        )?;
        ensure(
            self.small_account < self.large_account,
            "profit_scaling.small_account",
            "must be below large_account",
        )?;
        ensure(
            self.volatility_reference > 0.0,
            "profit_scaling.volatility_reference",
            "must be positive",
        )?;
        self.lots.validate("profit_scaling.lots")
    }

    pub fn account_factor(&self, balance: f64) -> f64 {
        if balance < self.small_account {
            0.7
        } else if balance >= self.large_account {
            1.2
        } else {
            1.0
        }
    }

    pub fn volatility_factor(&self, volatility: f64) -> f64 {
        if volatility <= 0.0 {
            1.0
        } else {
            (volatility / self.volatility_reference).clamp(0.5, 2.0)
        }
    }

    /// `aligned_trend` is the trend strength signed so that positive means
    /// "with the position".
    pub fn momentum_factor(&self, aligned_trend: f64) -> f64 {
        if aligned_trend > 0.5 {
            1.3
        } else if aligned_trend < -0.3 {
            0.8
        } else {
            1.0
        }
    }

    pub fn giveback_for(&self, tiers_taken: usize) -> f64 {
        let idx = tiers_taken.min(self.givebacks.len() - 1);
        self.givebacks[idx]
    }
}

/// Per-ticket scaling progress.
#[derive(Debug, Clone, Default)]
pub struct ScalingState {
    pub initial_volume: Option<f64>,
    pub taken: usize,
    pub pending: Option<usize>,
}

pub struct ProfitScaling {
    config: ProfitScalingConfig,
}

impl ProfitScaling {
    pub fn new(config: ProfitScalingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Scaled targets in percent of entry.
    pub fn targets(&self, balance: f64, volatility: f64, aligned_trend: f64) -> Vec<f64> {
        let c = &self.config;
        let factor = c.account_factor(balance) * c.volatility_factor(volatility) * c.momentum_factor(aligned_trend);
        c.base_targets_pct.iter().map(|t| t * factor).collect()
    }
}

impl ExitStrategy for ProfitScaling {
    fn name(&self) -> &str {
        "profit_scaling"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::ProfitScaling
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let cfg = &self.config;
        let position = ctx.position;
        let pc = ctx.position_ctx;
        let aligned = ctx.market.trend_strength * position.side.sign();
        let targets = self.targets(ctx.account.balance, ctx.market.volatility, aligned);

        let state = scope.state::<ScalingState>()?;
        let initial = *state.initial_volume.get_or_insert(position.volume);
        if state.pending.is_some() {
            return Ok(None);
        }

        let next = state.taken;
        if let Some(target) = targets.get(next).copied().filter(|t| pc.pnl_pct >= *t) {
            let last = next + 1 == targets.len();
            let volume = round_lots(
                cfg.lots
                    .close_volume(initial * cfg.close_fractions[next], position.volume, last),
            );
            state.pending = Some(next);
            let reason = format!("Profit tier {} at {:.2}% (target {:.2}%)", next + 1, pc.pnl_pct, target);
            info!(ticket = position.ticket, tier = next, volume, %reason, "Profit scaling tier");

            let signal = if volume >= position.volume {
                ExitSignal::close(position.ticket, self.name(), reason, cfg.priority)
            } else {
                ExitSignal::partial(position.ticket, self.name(), reason, cfg.priority, volume)
            };
            return Ok(Some(signal.with_tier(next).at(ctx.now)));
        }

        if pc.max_favorable_pct >= targets[0] && pc.max_favorable_pct > 0.0 {
            let allowed = cfg.giveback_for(state.taken);
            let retrace = (pc.max_favorable_pct - pc.pnl_pct) / pc.max_favorable_pct;
            if retrace > allowed {
                info!(
                    ticket = position.ticket,
                    retrace = format!("{:.2}", retrace),
                    allowed,
                    "Profit giveback protection"
                );
                return Ok(Some(
                    ExitSignal::close(
                        position.ticket,
                        self.name(),
                        format!(
                            "Giveback {:.0}% of {:.2}% peak exceeds {:.0}%",
                            retrace * 100.0,
                            pc.max_favorable_pct,
                            allowed * 100.0
                        ),
                        cfg.giveback_priority,
                    )
                    .at(ctx.now),
                ));
            }
        }

        debug!(ticket = position.ticket, pnl_pct = pc.pnl_pct, next_tier = next, "No scaling tier due");
        Ok(None)
    }

    fn on_outcome(
        &self,
        signal: &ExitSignal,
        result: &CloseResult,
        scope: &mut StrategyScope<'_>,
    ) -> Result<(), StrategyError> {
        let Some(tier) = signal.tier else {
            return Ok(());
        };
        let state = scope.state::<ScalingState>()?;
        if state.pending != Some(tier) {
            return Ok(());
        }
        state.pending = None;
        if result.is_success() {
            state.taken = tier + 1;
        } else {
            warn!(ticket = signal.ticket, tier, status = %result.status, "Scaling tier not filled — will retry");
        }
        Ok(())
    }

    fn on_superseded(&self, signal: &ExitSignal, scope: &mut StrategyScope<'_>) -> Result<(), StrategyError> {
        if let Some(tier) = signal.tier {
            let state = scope.state::<ScalingState>()?;
            if state.pending == Some(tier) {
                state.pending = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::fixtures::{position, Harness};
    use crate::types::Side;

    fn strategy() -> ProfitScaling {
        ProfitScaling::new(ProfitScalingConfig::default()).unwrap()
    }

    #[test]
    fn targets_scale_with_account_volatility_and_momentum() {
        let s = strategy();
        assert_eq!(s.targets(1000.0, 0.0, 0.0), vec![0.5, 1.0, 2.0]);
        let small = s.targets(200.0, 0.0, 0.0);
        assert!((small[0] - 0.35).abs() < 1e-9);
        let wild = s.targets(1000.0, 2.0, 0.0);
        assert!((wild[0] - 1.0).abs() < 1e-9, "volatility factor capped at 2");
        let running = s.targets(1000.0, 0.0, 0.8);
        assert!((running[0] - 0.65).abs() < 1e-9);
        let fading = s.targets(1000.0, 0.0, -0.5);
        assert!((fading[0] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn tiers_fire_in_order_and_wait_for_confirmation() {
        let s = strategy();
        let mut h = Harness::new(position(Side::Long, 100.6));
        h.account.balance = 1000.0;

        let first = h.run(&s).unwrap();
        assert_eq!(first.tier, Some(0));
        assert_eq!(first.volume(), Some(0.3));

        h.set_price(101.2);
        assert!(h.run(&s).is_none(), "tier 0 still in flight");

        h.feedback(&s, &first, &CloseResult::filled(0.3, 0.18));
        h.position.volume = 0.7;
        let second = h.run(&s).unwrap();
        assert_eq!(second.tier, Some(1));
        assert_eq!(second.volume(), Some(0.3));
        h.feedback(&s, &second, &CloseResult::filled(0.3, 0.36));

        h.position.volume = 0.4;
        h.set_price(102.1);
        let last = h.run(&s).unwrap();
        assert_eq!(last.tier, Some(2));
        assert_eq!(last.volume(), None, "last tier closes the remainder");
    }

    #[test]
    fn failed_or_superseded_tier_is_retried() {
        let s = strategy();
        let mut h = Harness::new(position(Side::Long, 100.6));
        h.account.balance = 1000.0;

        let first = h.run(&s).unwrap();
        h.feedback(&s, &first, &CloseResult::failed("timeout"));
        let again = h.run(&s).unwrap();
        assert_eq!(again.tier, Some(0));

        h.supersede(&s, &again);
        assert_eq!(h.run(&s).unwrap().tier, Some(0));
    }

    #[test]
    fn giveback_closes_the_remainder() {
        let s = strategy();
        let mut h = Harness::new(position(Side::Long, 100.6));
        h.account.balance = 1000.0;
        let first = h.run(&s).unwrap();
        h.feedback(&s, &first, &CloseResult::filled(0.3, 0.18));
        h.position.volume = 0.7;

        h.set_price(100.8);
        assert!(h.run(&s).is_none());
        // one tier taken → 55% allowed; 100.8 peak → 0.8%, 0.3% is a 62.5% retrace
        h.set_price(100.3);
        let signal = h.run(&s).unwrap();
        assert_eq!(signal.volume(), None);
        assert_eq!(signal.priority, 65);
    }
}
