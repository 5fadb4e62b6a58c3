// =============================================================================
// Threshold exits — time, profit target, adverse movement
// =============================================================================
//
// Stateless single-threshold rules. Each reads only the position context and
// fires a full close when its level is crossed.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::state::StrategyScope;
use crate::types::ExitSignal;

// =============================================================================
// TimeBased
// =============================================================================

fn default_max_holding_minutes() -> f64 {
    480.0
}
fn default_close_before_market_close() -> bool {
    true
}
fn default_time_priority() -> u8 {
    40
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBasedConfig {
    #[serde(default = "default_max_holding_minutes")]
    pub max_holding_minutes: f64,
    #[serde(default = "default_close_before_market_close")]
    pub close_before_market_close: bool,
    #[serde(default = "default_time_priority")]
    pub priority: u8,
}

impl Default for TimeBasedConfig {
    fn default() -> Self {
        Self {
            max_holding_minutes: default_max_holding_minutes(),
            close_before_market_close: default_close_before_market_close(),
            priority: default_time_priority(),
        }
    }
}

impl TimeBasedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.max_holding_minutes > 0.0, "time_based.max_holding_minutes", "must be positive")
    }
}

pub struct TimeBased {
    config: TimeBasedConfig,
}

impl TimeBased {
    pub fn new(config: TimeBasedConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for TimeBased {
    fn name(&self) -> &str {
        "time_based"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::TimeBased
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let held = ctx.position_ctx.holding_minutes;
        let reason = if held >= self.config.max_holding_minutes {
            format!("Max holding time reached ({:.0} min)", held)
        } else if self.config.close_before_market_close && ctx.market.market_close_imminent {
            "Market close imminent".to_string()
        } else {
            return Ok(None);
        };

        info!(ticket = ctx.position.ticket, held_min = format!("{:.1}", held), %reason, "Time exit");
        Ok(Some(
            ExitSignal::close(ctx.position.ticket, self.name(), reason, self.config.priority).at(ctx.now),
        ))
    }
}

// =============================================================================
// ProfitTarget
// =============================================================================

fn default_target_pct() -> Option<f64> {
    Some(1.5)
}
fn default_profit_priority() -> u8 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTargetConfig {
    /// Absolute profit in account currency.
    #[serde(default)]
    pub target_amount: Option<f64>,
    /// Profit in percent of entry.
    #[serde(default = "default_target_pct")]
    pub target_pct: Option<f64>,
    #[serde(default = "default_profit_priority")]
    pub priority: u8,
}

impl Default for ProfitTargetConfig {
    fn default() -> Self {
        Self {
            target_amount: None,
            target_pct: default_target_pct(),
            priority: default_profit_priority(),
        }
    }
}

impl ProfitTargetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.target_amount.is_some() || self.target_pct.is_some(),
            "profit_target",
            "set target_amount and/or target_pct",
        )?;
        ensure(
            self.target_amount.map_or(true, |a| a > 0.0),
            "profit_target.target_amount",
            "must be positive",
        )?;
        ensure(
            self.target_pct.map_or(true, |p| p > 0.0),
            "profit_target.target_pct",
            "must be positive",
        )
    }
}

pub struct ProfitTarget {
    config: ProfitTargetConfig,
}

impl ProfitTarget {
    pub fn new(config: ProfitTargetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for ProfitTarget {
    fn name(&self) -> &str {
        "profit_target"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::ProfitTarget
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let pc = ctx.position_ctx;
        let reason = match (self.config.target_amount, self.config.target_pct) {
            (Some(amount), _) if pc.unrealized_pnl >= amount => {
                format!("Profit target {:.2} reached ({:.2})", amount, pc.unrealized_pnl)
            }
            (_, Some(pct)) if pc.pnl_pct >= pct => {
                format!("Profit target {:.2}% reached ({:.2}%)", pct, pc.pnl_pct)
            }
            _ => return Ok(None),
        };

        info!(ticket = ctx.position.ticket, %reason, "Profit target exit");
        Ok(Some(
            ExitSignal::close(ctx.position.ticket, self.name(), reason, self.config.priority)
                .with_exit_price(ctx.position.current_price)
                .at(ctx.now),
        ))
    }
}

// =============================================================================
// AdverseMovement
// =============================================================================

fn default_max_adverse_pct() -> f64 {
    1.5
}
fn default_retrace_fraction() -> f64 {
    0.6
}
fn default_min_peak_pct() -> f64 {
    0.5
}
fn default_adverse_priority() -> u8 {
    75
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdverseMovementConfig {
    /// Current loss, % of entry, that forces an exit.
    #[serde(default = "default_max_adverse_pct")]
    pub max_adverse_pct: f64,
    /// Fraction of a meaningful peak that may be handed back.
    #[serde(default = "default_retrace_fraction")]
    pub retrace_fraction: f64,
    /// Peak profit (% of entry) below which retraces are ignored.
    #[serde(default = "default_min_peak_pct")]
    pub min_peak_pct: f64,
    #[serde(default = "default_adverse_priority")]
    pub priority: u8,
}

impl Default for AdverseMovementConfig {
    fn default() -> Self {
        Self {
            max_adverse_pct: default_max_adverse_pct(),
            retrace_fraction: default_retrace_fraction(),
            min_peak_pct: default_min_peak_pct(),
            priority: default_adverse_priority(),
        }
    }
}

impl AdverseMovementConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.max_adverse_pct > 0.0, "adverse_movement.max_adverse_pct", "must be positive")?;
        ensure(
            self.retrace_fraction > 0.0 && self.retrace_fraction <= 1.0,
            "adverse_movement.retrace_fraction",
            "must be in (0, 1]",
        )?;
        ensure(self.min_peak_pct > 0.0, "adverse_movement.min_peak_pct", "must be positive")
    }
}

pub struct AdverseMovement {
    config: AdverseMovementConfig,
}

impl AdverseMovement {
    pub fn new(config: AdverseMovementConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for AdverseMovement {
    fn name(&self) -> &str {
        "adverse_movement"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::AdverseMovement
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let cfg = &self.config;
        let pc = ctx.position_ctx;
        let adverse = -pc.pnl_pct;

        let reason = if adverse >= cfg.max_adverse_pct {
            format!("Adverse move {:.2}% >= {:.2}%", adverse, cfg.max_adverse_pct)
        } else if pc.max_favorable_pct >= cfg.min_peak_pct
            && (pc.max_favorable_pct - pc.pnl_pct) / pc.max_favorable_pct >= cfg.retrace_fraction
        {
            format!(
                "Retraced {:.0}% of {:.2}% peak",
                (pc.max_favorable_pct - pc.pnl_pct) / pc.max_favorable_pct * 100.0,
                pc.max_favorable_pct
            )
        } else {
            return Ok(None);
        };

        info!(ticket = ctx.position.ticket, %reason, "Adverse movement exit");
        Ok(Some(
            ExitSignal::close(ctx.position.ticket, self.name(), reason, cfg.priority)
                .with_exit_price(ctx.position.current_price)
                .at(ctx.now),
        ))
    }
}
