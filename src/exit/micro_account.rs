// =============================================================================
// Account-level protection — micro-account profit locks and survival mode
// =============================================================================
//
// MicroAccountProtection
//   1. Equity drawdown from its peak beyond `emergency_drawdown_pct`
//      → emergency close of every position, priority 100.
//   2. Balance-tiered profit lock: once a position's best profit reaches the
//      lock level for the account size, it is closed if profit falls back
//      under half of that level.
//   3. Equity at `equity_multiple` × the starting equity → bank winners.
//   4. RSI leaving overbought (longs) / oversold (shorts) → close winners.
//
// SurvivalMode
//   Critical balance, thin margin level or a hard account drawdown closes
//   everything regardless of P&L.
// =============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::state::StrategyScope;
use crate::types::{keys, ExitSignal, Side, MAX_PRIORITY};

// =============================================================================
// MicroAccountProtection
// =============================================================================

/// Profit lock for accounts up to `max_balance` (`None` = no upper bound).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockTier {
    pub max_balance: Option<f64>,
    pub lock_pct: f64,
}

fn default_lock_tiers() -> Vec<LockTier> {
    vec![
        LockTier { max_balance: Some(100.0), lock_pct: 0.5 },
        LockTier { max_balance: Some(500.0), lock_pct: 1.0 },
        LockTier { max_balance: Some(1000.0), lock_pct: 1.5 },
        LockTier { max_balance: None, lock_pct: 2.0 },
    ]
}
fn default_equity_multiple() -> f64 {
    2.0
}
fn default_emergency_drawdown_pct() -> f64 {
    20.0
}
fn default_rsi_overbought() -> f64 {
    70.0
}
fn default_rsi_oversold() -> f64 {
    30.0
}
fn default_micro_priority() -> u8 {
    85
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroAccountConfig {
    /// Ascending by `max_balance`; the last tier should be unbounded.
    #[serde(default = "default_lock_tiers")]
    pub lock_tiers: Vec<LockTier>,
    /// Starting equity. Taken from the first observation when unset.
    #[serde(default)]
    pub initial_equity: Option<f64>,
    #[serde(default = "default_equity_multiple")]
    pub equity_multiple: f64,
    #[serde(default = "default_emergency_drawdown_pct")]
    pub emergency_drawdown_pct: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_micro_priority")]
    pub priority: u8,
}

impl Default for MicroAccountConfig {
    fn default() -> Self {
        Self {
            lock_tiers: default_lock_tiers(),
            initial_equity: None,
            equity_multiple: default_equity_multiple(),
            emergency_drawdown_pct: default_emergency_drawdown_pct(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            priority: default_micro_priority(),
        }
    }
}

impl MicroAccountConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.lock_tiers.is_empty(), "micro_account.lock_tiers", "need at least one tier")?;
        ensure(
            self.lock_tiers.iter().all(|t| t.lock_pct > 0.0),
            "micro_account.lock_tiers",
            "lock_pct must be positive",
        )?;
        let bounds: Vec<f64> = self.lock_tiers.iter().filter_map(|t| t.max_balance).collect();
        ensure(
            bounds.windows(2).all(|w| w[1] > w[0]),
            "micro_account.lock_tiers",
            "max_balance must be ascending",
        )?;
        ensure(self.equity_multiple > 1.0, "micro_account.equity_multiple", "must be > 1")?;
        ensure(
            self.emergency_drawdown_pct > 0.0 && self.emergency_drawdown_pct < 100.0,
            "micro_account.emergency_drawdown_pct",
            "must be in (0, 100)",
        )?;
        ensure(
            self.rsi_oversold < self.rsi_overbought,
            "micro_account.rsi_oversold",
            "must be below rsi_overbought",
        )
    }

    /// Lock level (% of entry) for an account of `balance`.
    pub fn lock_pct(&self, balance: f64) -> f64 {
        self.lock_tiers
            .iter()
            .find(|t| t.max_balance.map_or(true, |max| balance <= max))
            .or(self.lock_tiers.last())
            .map_or(0.0, |t| t.lock_pct)
    }
}

#[derive(Debug, Clone, Default)]
struct EquityMarks {
    initial: Option<f64>,
    peak: f64,
}

/// Per-ticket lock progress.
#[derive(Debug, Clone, Default)]
pub struct LockState {
    pub armed_at_pct: Option<f64>,
}

pub struct MicroAccountProtection {
    config: MicroAccountConfig,
    marks: Mutex<EquityMarks>,
}

impl MicroAccountProtection {
    pub fn new(config: MicroAccountConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let marks = EquityMarks {
            initial: config.initial_equity,
            peak: config.initial_equity.unwrap_or(0.0),
        };
        Ok(Self {
            config,
            marks: Mutex::new(marks),
        })
    }

    /// Record `equity`; returns `(initial, peak)`.
    fn observe_equity(&self, equity: f64) -> (f64, f64) {
        let mut marks = self.marks.lock();
        let initial = *marks.initial.get_or_insert(equity);
        marks.peak = marks.peak.max(equity);
        (initial, marks.peak)
    }

    fn rsi_exit(&self, side: Side, rsi: f64, prev: f64) -> bool {
        match side {
            Side::Long => prev >= self.config.rsi_overbought && rsi < self.config.rsi_overbought,
            Side::Short => prev <= self.config.rsi_oversold && rsi > self.config.rsi_oversold,
        }
    }
}

impl ExitStrategy for MicroAccountProtection {
    fn name(&self) -> &str {
        "micro_account"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MicroAccountProtection
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
        let equity = ctx.account.equity;
        let ticket = position.ticket;

        if equity > 0.0 {
            let (initial, peak) = self.observe_equity(equity);
            let floor = peak * (1.0 - cfg.emergency_drawdown_pct / 100.0);
            if equity <= floor {
                warn!(
                    ticket,
                    equity = format!("{:.2}", equity),
                    peak = format!("{:.2}", peak),
                    "Micro account emergency — equity drawdown limit"
                );
                return Ok(Some(
                    ExitSignal::close(
                        ticket,
                        self.name(),
                        format!("Equity {:.2} down {:.1}% from peak {:.2}", equity, (1.0 - equity / peak) * 100.0, peak),
                        MAX_PRIORITY,
                    )
                    .at(ctx.now),
                ));
            }

            if pc.in_profit && equity >= initial * cfg.equity_multiple {
                info!(ticket, equity, initial, "Equity target reached — locking profit");
                return Ok(Some(
                    ExitSignal::close(
                        ticket,
                        self.name(),
                        format!("Equity {:.2} reached {:.1}x start", equity, cfg.equity_multiple),
                        cfg.priority,
                    )
                    .at(ctx.now),
                ));
            }
        }

        let lock = cfg.lock_pct(ctx.account.balance);
        let state = scope.state::<LockState>()?;
        if state.armed_at_pct.is_none() && pc.max_favorable_pct >= lock {
            state.armed_at_pct = Some(lock);
            info!(ticket, lock_pct = lock, "Profit lock armed");
        }
        if let Some(armed) = state.armed_at_pct {
            if pc.pnl_pct <= armed / 2.0 {
                return Ok(Some(
                    ExitSignal::close(
                        ticket,
                        self.name(),
                        format!("Profit lock: {:.2}% fell under {:.2}% after reaching {:.2}%", pc.pnl_pct, armed / 2.0, armed),
                        cfg.priority,
                    )
                    .at(ctx.now),
                ));
            }
        }

        if pc.in_profit {
            if let (Some(rsi), Some(prev)) = (ctx.indicators.get(keys::RSI), ctx.indicators.get(keys::RSI_PREV)) {
                if self.rsi_exit(position.side, rsi, prev) {
                    return Ok(Some(
                        ExitSignal::close(
                            ticket,
                            self.name(),
                            format!("RSI momentum reversal {:.1} -> {:.1}", prev, rsi),
                            cfg.priority,
                        )
                        .with_confidence(0.7)
                        .at(ctx.now),
                    ));
                }
            }
        }

        Ok(None)
    }
}

// =============================================================================
// SurvivalMode
// =============================================================================

fn default_critical_balance() -> f64 {
    20.0
}
fn default_min_margin_level() -> f64 {
    150.0
}
fn default_max_drawdown_pct() -> f64 {
    30.0
}
fn default_survival_priority() -> u8 {
    MAX_PRIORITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalConfig {
    #[serde(default = "default_critical_balance")]
    pub critical_balance: f64,
    /// Margin level in percent.
    #[serde(default = "default_min_margin_level")]
    pub min_margin_level: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_survival_priority")]
    pub priority: u8,
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        Self {
            critical_balance: default_critical_balance(),
            min_margin_level: default_min_margin_level(),
            max_drawdown_pct: default_max_drawdown_pct(),
            priority: default_survival_priority(),
        }
    }
}

impl SurvivalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.critical_balance >= 0.0, "survival.critical_balance", "must be >= 0")?;
        ensure(self.min_margin_level >= 0.0, "survival.min_margin_level", "must be >= 0")?;
        ensure(
            self.max_drawdown_pct > 0.0 && self.max_drawdown_pct <= 100.0,
            "survival.max_drawdown_pct",
            "must be in (0, 100]",
        )
    }
}

pub struct SurvivalMode {
    config: SurvivalConfig,
}

impl SurvivalMode {
    pub fn new(config: SurvivalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for SurvivalMode {
    fn name(&self) -> &str {
        "survival"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::SurvivalMode
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
        let account = ctx.account;
        // An all-zero snapshot means the account layer had nothing for us.
        if account.balance <= 0.0 && account.equity <= 0.0 {
            return Ok(None);
        }

        let reason = if account.balance <= cfg.critical_balance {
            format!("Balance {:.2} at or below critical {:.2}", account.balance, cfg.critical_balance)
        } else if let Some(level) = account.margin_level.filter(|l| *l < cfg.min_margin_level) {
            format!("Margin level {:.0}% below {:.0}%", level, cfg.min_margin_level)
        } else if account.drawdown_pct >= cfg.max_drawdown_pct {
            format!("Account drawdown {:.1}% beyond {:.1}%", account.drawdown_pct, cfg.max_drawdown_pct)
        } else {
            return Ok(None);
        };

        warn!(ticket = ctx.position.ticket, %reason, "SURVIVAL MODE — closing position");
        Ok(Some(
            ExitSignal::close(ctx.position.ticket, self.name(), reason, cfg.priority).at(ctx.now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::fixtures::{position, Harness};

    fn micro() -> MicroAccountProtection {
        MicroAccountProtection::new(MicroAccountConfig::default()).unwrap()
    }

    #[test]
    fn lock_tier_follows_balance() {
        let cfg = MicroAccountConfig::default();
        assert_eq!(cfg.lock_pct(50.0), 0.5);
        assert_eq!(cfg.lock_pct(100.0), 0.5);
        assert_eq!(cfg.lock_pct(300.0), 1.0);
        assert_eq!(cfg.lock_pct(900.0), 1.5);
        assert_eq!(cfg.lock_pct(50_000.0), 2.0);
    }

    #[test]
    fn profit_lock_arms_then_fires_at_half() {
        let strategy = micro();
        let mut h = Harness::new(position(Side::Long, 100.0));
        h.account.balance = 80.0;
        h.account.equity = 80.0;

        h.set_price(100.6);
        assert!(h.run(&strategy).is_none(), "armed, not fired");
        h.set_price(100.3);
        assert!(h.run(&strategy).is_none());
        h.set_price(100.2);
        let signal = h.run(&strategy).unwrap();
        assert!(signal.reason.starts_with("Profit lock"));
        assert_eq!(signal.priority, 85);
    }

    #[test]
    fn equity_drawdown_is_an_emergency() {
        let strategy = micro();
        let mut h = Harness::new(position(Side::Long, 99.0));
        h.account.equity = 100.0;
        assert!(h.run(&strategy).is_none());
        h.account.equity = 79.0;
        let signal = h.run(&strategy).unwrap();
        assert_eq!(signal.priority, 100);
    }

    #[test]
    fn doubled_equity_banks_winners_only() {
        let strategy = MicroAccountProtection::new(MicroAccountConfig {
            initial_equity: Some(50.0),
            ..Default::default()
        })
        .unwrap();
        let mut loser = Harness::new(position(Side::Long, 99.9));
        loser.account.equity = 100.0;
        assert!(loser.run(&strategy).is_none());

        let mut winner = Harness::new(position(Side::Long, 100.1));
        winner.account.equity = 100.0;
        assert!(winner.run(&strategy).unwrap().reason.contains("2.0x"));
    }

    #[test]
    fn rsi_turn_closes_winning_short() {
        let strategy = micro();
        let mut h = Harness::new(position(Side::Short, 99.9));
        h.indicators.set(keys::RSI, 33.0);
        h.indicators.set(keys::RSI_PREV, 28.0);
        assert!(h.run(&strategy).unwrap().reason.contains("RSI"));
    }

    #[test]
    fn survival_triggers() {
        let strategy = SurvivalMode::new(SurvivalConfig::default()).unwrap();
        let mut h = Harness::new(position(Side::Long, 101.0));
        assert!(h.run(&strategy).is_none());

        h.account.margin_level = Some(120.0);
        assert!(h.run(&strategy).unwrap().reason.contains("Margin"));

        h.account.margin_level = None;
        h.account.drawdown_pct = 31.0;
        assert!(h.run(&strategy).unwrap().reason.contains("drawdown"));

        h.account.drawdown_pct = 0.0;
        h.account.balance = 15.0;
        let s = h.run(&strategy).unwrap();
        assert_eq!(s.priority, 100);
        assert!(s.reason.contains("critical"));
    }
}
