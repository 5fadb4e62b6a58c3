// =============================================================================
// Adaptive Loss Curve — balance-dependent maximum tolerated loss
// =============================================================================
//
// Maps account balance to the largest loss the engine tolerates, per trade or
// for the whole account:
//
//   rate%(b)   logistic blend of (balance, rate%) anchors in ln-balance space;
//              each step between neighbouring anchors is a sigmoid centred at
//              their geometric midpoint
//   micro(b)   1 / (1 + steepness × (micro_threshold / b − 1))  for b < threshold
//   loss       b × rate% × micro × scope × recovery
//   bounded    max(loss, floor), then min(·, b × cap% × scope)
//
// Recovery mode: entered when drawdown from the observed peak reaches the
// threshold, cleared once drawdown falls below half of it. While active the
// tolerated loss is multiplied by `recovery_multiplier`. Only `reset()` clears
// the observed peak.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ensure, ConfigError};
use crate::telemetry::{SharedSink, TelemetryEvent};

/// One (balance, rate) anchor of the curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveAnchor {
    pub balance: f64,
    /// Tolerated loss in percent of balance at this anchor.
    pub rate_pct: f64,
}

fn default_anchors() -> Vec<CurveAnchor> {
    [(100.0, 1.0), (500.0, 2.0), (2_000.0, 3.0), (10_000.0, 4.0), (50_000.0, 5.0)]
        .into_iter()
        .map(|(balance, rate_pct)| CurveAnchor { balance, rate_pct })
        .collect()
}
fn default_temperature() -> f64 {
    0.5
}
fn default_micro_threshold() -> f64 {
    100.0
}
fn default_micro_steepness() -> f64 {
    0.5
}
fn default_per_trade_multiplier() -> f64 {
    0.5
}
fn default_recovery_drawdown_pct() -> f64 {
    10.0
}
fn default_recovery_multiplier() -> f64 {
    0.5
}
fn default_min_loss() -> f64 {
    0.1
}
fn default_max_loss_cap_pct() -> f64 {
    6.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossCurveConfig {
    #[serde(default = "default_anchors")]
    pub anchors: Vec<CurveAnchor>,
    /// Sigmoid width in ln-balance units.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_micro_threshold")]
    pub micro_threshold: f64,
    #[serde(default = "default_micro_steepness")]
    pub micro_steepness: f64,
    /// Scope multiplier for a single trade (the account scope uses 1.0).
    #[serde(default = "default_per_trade_multiplier")]
    pub per_trade_multiplier: f64,
    #[serde(default = "default_recovery_drawdown_pct")]
    pub recovery_drawdown_pct: f64,
    #[serde(default = "default_recovery_multiplier")]
    pub recovery_multiplier: f64,
    /// Absolute floor in account currency.
    #[serde(default = "default_min_loss")]
    pub min_loss: f64,
    #[serde(default = "default_max_loss_cap_pct")]
    pub max_loss_cap_pct: f64,
}

impl Default for LossCurveConfig {
    fn default() -> Self {
        Self {
            anchors: default_anchors(),
            temperature: default_temperature(),
            micro_threshold: default_micro_threshold(),
            micro_steepness: default_micro_steepness(),
            per_trade_multiplier: default_per_trade_multiplier(),
            recovery_drawdown_pct: default_recovery_drawdown_pct(),
            recovery_multiplier: default_recovery_multiplier(),
            min_loss: default_min_loss(),
            max_loss_cap_pct: default_max_loss_cap_pct(),
        }
    }
}

impl LossCurveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.anchors.len() >= 2, "loss_curve.anchors", "need at least two anchors")?;
        for pair in self.anchors.windows(2) {
            ensure(
                pair[0].balance > 0.0 && pair[0].balance < pair[1].balance,
                "loss_curve.anchors",
                "balances must be positive and strictly increasing",
            )?;
            ensure(
                pair[0].rate_pct > 0.0 && pair[0].rate_pct <= pair[1].rate_pct,
                "loss_curve.anchors",
                "rates must be positive and non-decreasing",
            )?;
        }
        ensure(self.temperature > 0.0, "loss_curve.temperature", "must be positive")?;
        ensure(self.micro_threshold > 0.0, "loss_curve.micro_threshold", "must be positive")?;
        ensure(self.micro_steepness >= 0.0, "loss_curve.micro_steepness", "must be >= 0")?;
        ensure(
            self.per_trade_multiplier > 0.0 && self.per_trade_multiplier <= 1.0,
            "loss_curve.per_trade_multiplier",
            "must be in (0, 1]",
        )?;
        ensure(
            self.recovery_drawdown_pct > 0.0 && self.recovery_drawdown_pct < 100.0,
            "loss_curve.recovery_drawdown_pct",
            "must be in (0, 100)",
        )?;
        ensure(
            self.recovery_multiplier > 0.0 && self.recovery_multiplier <= 1.0,
            "loss_curve.recovery_multiplier",
            "must be in (0, 1]",
        )?;
        ensure(self.min_loss >= 0.0, "loss_curve.min_loss", "must be >= 0")?;
        ensure(
            self.max_loss_cap_pct > 0.0 && self.max_loss_cap_pct <= 100.0,
            "loss_curve.max_loss_cap_pct",
            "must be in (0, 100]",
        )
    }
}

/// Observed peak and recovery flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossCurveState {
    pub peak_balance: f64,
    pub recovery_mode: bool,
}

/// Balance → maximum tolerated loss, with a recovery-mode state machine.
pub struct AdaptiveLossCurve {
    config: LossCurveConfig,
    state: Mutex<LossCurveState>,
    sink: SharedSink,
}

impl AdaptiveLossCurve {
    pub fn new(config: LossCurveConfig, sink: SharedSink) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            anchors = config.anchors.len(),
            micro_threshold = config.micro_threshold,
            cap_pct = config.max_loss_cap_pct,
            "AdaptiveLossCurve initialised"
        );
        Ok(Self {
            config,
            state: Mutex::new(LossCurveState::default()),
            sink,
        })
    }

    pub fn config(&self) -> &LossCurveConfig {
        &self.config
    }

    pub fn state(&self) -> LossCurveState {
        self.state.lock().clone()
    }

    pub fn in_recovery(&self) -> bool {
        self.state.lock().recovery_mode
    }

    /// Operator action: forget the observed peak and leave recovery mode.
    pub fn reset(&self) {
        *self.state.lock() = LossCurveState::default();
        warn!("AdaptiveLossCurve reset by operator");
    }

    // -------------------------------------------------------------------------
    // Pure curve
    // -------------------------------------------------------------------------

    /// Blended loss rate in percent of balance.
    pub fn rate_pct(&self, balance: f64) -> f64 {
        let anchors = &self.config.anchors;
        let Some(first) = anchors.first() else {
            return 0.0;
        };
        if balance <= 0.0 {
            return first.rate_pct;
        }
        let x = balance.ln();
        let k = self.config.temperature;
        let mut rate = first.rate_pct;
        for pair in anchors.windows(2) {
            let mid = (pair[0].balance.ln() + pair[1].balance.ln()) / 2.0;
            let step = pair[1].rate_pct - pair[0].rate_pct;
            rate += step * sigmoid((x - mid) / k);
        }
        rate
    }

    /// Micro-account multiplier in (0, 1].
    pub fn micro_multiplier(&self, balance: f64) -> f64 {
        let micro = self.config.micro_threshold;
        if balance >= micro {
            return 1.0;
        }
        if balance <= 0.0 {
            return 0.0;
        }
        let m = 1.0 / (1.0 + self.config.micro_steepness * (micro / balance - 1.0));
        m.min(1.0)
    }

    /// Maximum tolerated loss without touching the recovery state.
    pub fn max_loss_for(&self, balance: f64, per_trade: bool, in_recovery: bool) -> f64 {
        if balance <= 0.0 || !balance.is_finite() {
            return 0.0;
        }
        let c = &self.config;
        let scope = if per_trade { c.per_trade_multiplier } else { 1.0 };
        let recovery = if in_recovery { c.recovery_multiplier } else { 1.0 };

        let raw = balance * self.rate_pct(balance) / 100.0 * self.micro_multiplier(balance) * scope * recovery;
        let cap = balance * c.max_loss_cap_pct / 100.0 * scope;
        raw.max(c.min_loss).min(cap)
    }

    // -------------------------------------------------------------------------
    // Stateful API
    // -------------------------------------------------------------------------

    /// Feed a balance observation; updates the peak and recovery mode.
    pub fn observe(&self, balance: f64) {
        if balance <= 0.0 || !balance.is_finite() {
            return;
        }
        let threshold = self.config.recovery_drawdown_pct;
        let mut state = self.state.lock();
        state.peak_balance = state.peak_balance.max(balance);
        let drawdown_pct = (state.peak_balance - balance) / state.peak_balance * 100.0;

        let change = if !state.recovery_mode && drawdown_pct >= threshold {
            Some(true)
        } else if state.recovery_mode && drawdown_pct < threshold / 2.0 {
            Some(false)
        } else {
            None
        };

        if let Some(active) = change {
            state.recovery_mode = active;
            drop(state);
            if active {
                warn!(
                    drawdown_pct = format!("{:.2}", drawdown_pct),
                    threshold, "Recovery mode ENTERED — loss tolerance reduced"
                );
            } else {
                info!(drawdown_pct = format!("{:.2}", drawdown_pct), "Recovery mode cleared");
            }
            self.sink.record(TelemetryEvent::RecoveryModeChanged {
                active,
                drawdown_pct,
                at: Utc::now(),
            });
        }
    }

    /// Observe `balance`, then return the current maximum tolerated loss.
    pub fn get_max_loss(&self, balance: f64, per_trade: bool) -> f64 {
        self.observe(balance);
        self.max_loss_for(balance, per_trade, self.in_recovery())
    }

    /// Whether an open loss of `pnl` breaches the per-trade limit.
    pub fn should_close_for_loss(&self, balance: f64, pnl: f64) -> (bool, String) {
        if pnl >= 0.0 {
            return (false, "position not in loss".to_string());
        }
        let limit = self.get_max_loss(balance, true);
        let loss = -pnl;
        let pct = if balance > 0.0 { loss / balance * 100.0 } else { 0.0 };
        let recovery = if self.in_recovery() { " [recovery]" } else { "" };

        if loss >= limit {
            let reason = format!(
                "Loss {:.2} ({:.2}% of balance) reached adaptive limit {:.2}{}",
                loss, pct, limit, recovery
            );
            debug!(balance, loss, limit, "Adaptive loss limit breached");
            (true, reason)
        } else {
            (false, format!("Loss {:.2} within adaptive limit {:.2}{}", loss, limit, recovery))
        }
    }
}

impl std::fmt::Debug for AdaptiveLossCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLossCurve")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// =============================================================================
// Tests
// =============================================================================
