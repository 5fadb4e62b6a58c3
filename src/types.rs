// =============================================================================
// Shared types used across the exit engine
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker-assigned position identifier.
pub type Ticket = u64;

/// Highest priority any decision can carry.
pub const MAX_PRIORITY: u8 = 100;

/// Clamp a signed priority into the `[0, 100]` band.
pub fn clamp_priority(value: i32) -> u8 {
    value.clamp(0, MAX_PRIORITY as i32) as u8
}

// =============================================================================
// Side
// =============================================================================

/// Position direction. Immutable for the life of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// +1.0 for longs, -1.0 for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Signed distance of `price` from `reference`, positive when in our favour.
    pub fn favorable_move(self, reference: f64, price: f64) -> f64 {
        self.sign() * (price - reference)
    }

    /// Price `distance` away from `reference` in the favourable direction.
    pub fn offset_favorable(self, reference: f64, distance: f64) -> f64 {
        reference + self.sign() * distance
    }

    /// Price `distance` away from `reference` in the adverse direction.
    pub fn offset_adverse(self, reference: f64, distance: f64) -> f64 {
        reference - self.sign() * distance
    }

    /// `true` when `candidate` is a more protective stop than `current`.
    pub fn is_tighter_stop(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// `true` once `price` has traded through `stop`.
    pub fn stop_crossed(self, price: f64, stop: f64) -> bool {
        match self {
            Self::Long => price <= stop,
            Self::Short => price >= stop,
        }
    }

    /// `true` once `price` has reached the favourable `target`.
    pub fn target_reached(self, price: f64, target: f64) -> bool {
        match self {
            Self::Long => price >= target,
            Self::Short => price <= target,
        }
    }

    /// Parse broker side strings ("BUY" / "SELL", "LONG" / "SHORT").
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Self::Long),
            "SELL" | "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "BUY"),
            Self::Short => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Position snapshot (owned by the external tracker)
// =============================================================================

/// Read-only snapshot of an open position as reported by the position tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub current_price: f64,
    /// Remaining open volume in lots.
    pub volume: f64,
    /// Unrealized P&L in account currency.
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    /// Largest unrealized profit seen by the tracker (currency, >= 0).
    #[serde(default)]
    pub peak_favorable: f64,
    /// Largest unrealized loss seen by the tracker (currency, >= 0).
    #[serde(default)]
    pub peak_adverse: f64,
}

impl Position {
    /// Unrealized P&L as a percentage of the entry price.
    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.favorable_move(self.entry_price, self.current_price) / self.entry_price * 100.0
    }

    /// Minutes elapsed since the position was opened.
    pub fn holding_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_seconds().max(0) as f64 / 60.0
    }

    /// Distance between entry and the initial stop, if a stop is set.
    pub fn risk_distance(&self) -> Option<f64> {
        self.stop_loss
            .map(|sl| (self.entry_price - sl).abs())
            .filter(|d| *d > 0.0)
    }
}

// =============================================================================
// Lot sizing
// =============================================================================

fn default_min_lot() -> f64 {
    0.01
}

fn default_lot_step() -> f64 {
    0.01
}

/// Broker volume constraints for partial closes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LotSpec {
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_lot_step")]
    pub lot_step: f64,
}

impl Default for LotSpec {
    fn default() -> Self {
        Self {
            min_lot: default_min_lot(),
            lot_step: default_lot_step(),
        }
    }
}

impl LotSpec {
    pub fn validate(&self, field: &str) -> Result<(), crate::error::ConfigError> {
        crate::error::ensure(
            self.min_lot > 0.0 && self.lot_step > 0.0,
            field,
            "min_lot and lot_step must be positive",
        )
    }

    /// Volume to close for a `desired` partial out of `available` lots.
    ///
    /// Rounded down to the lot step, at least the minimum lot, capped at
    /// `available`. Returns all of `available` when `close_all` is set or
    /// when the remainder would fall below the minimum lot.
    pub fn close_volume(&self, desired: f64, available: f64, close_all: bool) -> f64 {
        if available <= 0.0 {
            return 0.0;
        }
        if close_all {
            return available;
        }
        let steps = (desired / self.lot_step + 1e-9).floor();
        let volume = round_lots(steps * self.lot_step).max(self.min_lot).min(available);
        if available - volume < self.min_lot - 1e-9 {
            available
        } else {
            volume
        }
    }
}

/// Strip float noise from a lot quantity.
pub fn round_lots(volume: f64) -> f64 {
    (volume * 1e8).round() / 1e8
}

// =============================================================================
// Account + indicator snapshots
// =============================================================================

/// Account figures consumed from the account layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    /// Margin level in percent (equity / used margin × 100), if any margin is used.
    #[serde(default)]
    pub margin_level: Option<f64>,
    /// Drawdown from the peak balance in percent.
    #[serde(default)]
    pub drawdown_pct: f64,
}

/// Well-known indicator keys.
pub mod keys {
    pub const RSI: &str = "rsi";
    pub const RSI_PREV: &str = "rsi_prev";
    pub const MACD: &str = "macd";
    pub const MACD_SIGNAL: &str = "macd_signal";
    pub const MACD_PREV: &str = "macd_prev";
    pub const BB_UPPER: &str = "bb_upper";
    pub const BB_LOWER: &str = "bb_lower";
    pub const CLOSE: &str = "close";
    pub const VOLUME: &str = "volume";
    pub const VOLUME_AVG: &str = "volume_avg";
    pub const EMA_FAST: &str = "ema_fast";
    pub const EMA_SLOW: &str = "ema_slow";
    pub const EMA_FAST_PREV: &str = "ema_fast_prev";
    pub const EMA_SLOW_PREV: &str = "ema_slow_prev";
    pub const ATR: &str = "atr";
}

/// Flat key → value indicator map. Missing or non-finite values read as
/// "not available", never as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    values: HashMap<String, f64>,
}

impl IndicatorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().filter(|v| v.is_finite())
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.set(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for IndicatorSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Everything a strategy may read besides the position itself.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub indicators: IndicatorSnapshot,
    pub account: AccountSnapshot,
    pub now: DateTime<Utc>,
}

impl MarketData {
    pub fn new(indicators: IndicatorSnapshot, account: AccountSnapshot) -> Self {
        Self {
            indicators,
            account,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

// =============================================================================
// Exit signals, decisions and actions
// =============================================================================

/// What a signal asks the execution engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitIntent {
    /// Close `volume` lots, or everything when `None`.
    Close { volume: Option<f64> },
    /// Move the protective stop without closing.
    ModifyStop { new_stop_loss: f64 },
}

/// Exit proposal produced by a single strategy.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSignal {
    pub id: String,
    pub ticket: Ticket,
    pub strategy: String,
    pub reason: String,
    /// Strategy-declared urgency, 0–100. Defaults to the strategy's base priority.
    pub priority: u8,
    pub intent: ExitIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    /// Stop to install on the remainder once a partial close confirms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_after_close: Option<f64>,
    /// Tier index for tiered profit-taking strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<usize>,
    pub confidence: f64,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExitSignal {
    fn build(ticket: Ticket, strategy: &str, reason: String, priority: u8, intent: ExitIntent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ticket,
            strategy: strategy.to_string(),
            reason,
            priority: priority.min(MAX_PRIORITY),
            intent,
            exit_price: None,
            stop_after_close: None,
            tier: None,
            confidence: 1.0,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Full close of the position.
    pub fn close(ticket: Ticket, strategy: &str, reason: impl Into<String>, priority: u8) -> Self {
        Self::build(ticket, strategy, reason.into(), priority, ExitIntent::Close { volume: None })
    }

    /// Partial close of `volume` lots.
    pub fn partial(
        ticket: Ticket,
        strategy: &str,
        reason: impl Into<String>,
        priority: u8,
        volume: f64,
    ) -> Self {
        Self::build(
            ticket,
            strategy,
            reason.into(),
            priority,
            ExitIntent::Close {
                volume: Some(volume),
            },
        )
    }

    /// Stop modification without a close.
    pub fn modify_stop(
        ticket: Ticket,
        strategy: &str,
        reason: impl Into<String>,
        priority: u8,
        new_stop_loss: f64,
    ) -> Self {
        Self::build(
            ticket,
            strategy,
            reason.into(),
            priority,
            ExitIntent::ModifyStop { new_stop_loss },
        )
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_exit_price(mut self, price: f64) -> Self {
        self.exit_price = Some(price);
        self
    }

    pub fn with_tier(mut self, tier: usize) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_stop_after_close(mut self, stop: f64) -> Self {
        self.stop_after_close = Some(stop);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Partial volume, `None` for a full close or a stop modification.
    pub fn volume(&self) -> Option<f64> {
        match self.intent {
            ExitIntent::Close { volume } => volume,
            ExitIntent::ModifyStop { .. } => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self.intent, ExitIntent::Close { .. })
    }
}

/// The single decision returned by a coordinator or selector pass.
#[derive(Debug, Clone, Serialize)]
pub struct ExitDecision {
    pub signal: ExitSignal,
    /// Declared base priority of the strategy that produced the signal.
    pub base_priority: u8,
    /// Final priority after context adjustments, 0–100.
    pub priority: u8,
    /// Names of the adjustment rules (or scores) that shaped `priority`.
    pub adjustments: Vec<String>,
}

impl ExitDecision {
    pub fn ticket(&self) -> Ticket {
        self.signal.ticket
    }

    pub fn strategy(&self) -> &str {
        &self.signal.strategy
    }

    /// Translate into the actions handed to the execution engine.
    pub fn to_actions(&self, side: Side) -> Vec<ExitAction> {
        let signal = &self.signal;
        match signal.intent {
            ExitIntent::Close { volume } => {
                let mut actions = vec![ExitAction::Close {
                    ticket: signal.ticket,
                    volume,
                    reason: signal.reason.clone(),
                    priority: self.priority,
                    strategy: signal.strategy.clone(),
                    tier: signal.tier,
                }];
                if let (Some(_), Some(stop)) = (volume, signal.stop_after_close) {
                    actions.push(ExitAction::ModifyStop {
                        ticket: signal.ticket,
                        side,
                        new_stop_loss: stop,
                        reason: format!("{} (stop after partial)", signal.reason),
                        priority: self.priority,
                        strategy: signal.strategy.clone(),
                    });
                }
                actions
            }
            ExitIntent::ModifyStop { new_stop_loss } => vec![ExitAction::ModifyStop {
                ticket: signal.ticket,
                side,
                new_stop_loss,
                reason: signal.reason.clone(),
                priority: self.priority,
                strategy: signal.strategy.clone(),
            }],
        }
    }
}

/// Instruction handed to the external execution engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExitAction {
    Close {
        ticket: Ticket,
        /// `None` closes the entire remaining volume.
        volume: Option<f64>,
        reason: String,
        priority: u8,
        strategy: String,
        tier: Option<usize>,
    },
    ModifyStop {
        ticket: Ticket,
        side: Side,
        new_stop_loss: f64,
        reason: String,
        priority: u8,
        strategy: String,
    },
}

impl ExitAction {
    pub fn ticket(&self) -> Ticket {
        match self {
            Self::Close { ticket, .. } | Self::ModifyStop { ticket, .. } => *ticket,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::Close { priority, .. } | Self::ModifyStop { priority, .. } => *priority,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_helpers_are_direction_aware() {
        assert_eq!(Side::Long.favorable_move(100.0, 101.0), 1.0);
        assert_eq!(Side::Short.favorable_move(100.0, 101.0), -1.0);
        assert!(Side::Long.is_tighter_stop(99.0, 98.0));
        assert!(Side::Short.is_tighter_stop(101.0, 102.0));
        assert!(Side::Long.stop_crossed(97.9, 98.0));
        assert!(Side::Short.stop_crossed(102.0, 102.0));
        assert_eq!(Side::parse("sell"), Some(Side::Short));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn indicator_snapshot_ignores_non_finite_values() {
        let snap = IndicatorSnapshot::new()
            .with(keys::RSI, 55.0)
            .with(keys::ATR, f64::NAN);
        assert_eq!(snap.get(keys::RSI), Some(55.0));
        assert_eq!(snap.get(keys::ATR), None);
        assert_eq!(snap.get(keys::MACD), None);
    }

    #[test]
    fn partial_close_with_stop_emits_two_actions() {
        let signal = ExitSignal::partial(7, "tiered_rrr", "TP1", 70, 0.4).with_stop_after_close(100.05);
        let decision = ExitDecision {
            signal,
            base_priority: 70,
            priority: 70,
            adjustments: Vec::new(),
        };
        let actions = decision.to_actions(Side::Long);
        assert_eq!(actions.len(), 2);
        assert!(actions[0].is_close());
        assert!(matches!(
            actions[1],
            ExitAction::ModifyStop { new_stop_loss, .. } if (new_stop_loss - 100.05).abs() < 1e-9
        ));
    }

    #[test]
    fn lot_rounding_never_strands_a_sliver() {
        let lots = LotSpec::default();
        assert!((lots.close_volume(0.4, 1.0, false) - 0.4).abs() < 1e-9);
        assert!((lots.close_volume(0.037, 1.0, false) - 0.03).abs() < 1e-9);
        assert!((lots.close_volume(0.001, 1.0, false) - 0.01).abs() < 1e-9);
        // 0.105 left would be fine, 0.005 would not
        assert!((lots.close_volume(0.1, 0.105, false) - 0.105).abs() < 1e-9);
        assert!((lots.close_volume(0.3, 0.3, false) - 0.3).abs() < 1e-9);
        assert!((lots.close_volume(0.3, 0.7, true) - 0.7).abs() < 1e-9);
        assert_eq!(lots.close_volume(0.3, 0.0, false), 0.0);
    }

    #[test]
    fn clamp_priority_bounds() {
        assert_eq!(clamp_priority(-5), 0);
        assert_eq!(clamp_priority(130), 100);
        assert_eq!(clamp_priority(42), 42);
    }
}
