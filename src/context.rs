// =============================================================================
// Market + Position Context — per-tick inputs to priority adjustment
// =============================================================================
//
// MarketContext is recomputed every tick from the indicator snapshot and the
// broker quote. PositionContext is derived from the position snapshot plus a
// running PeakTracker kept per ticket in the position arena.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{keys, IndicatorSnapshot, Position};

/// EMA separation (in percent of the slow EMA) that maps to a trend strength
/// of tanh(1) ≈ 0.76.
const TREND_SEPARATION_SCALE_PCT: f64 = 0.5;

// =============================================================================
// Session
// =============================================================================

/// Trading session derived from the UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Session {
    Asian,
    London,
    Overlap,
    NewYork,
    OffHours,
}

impl Session {
    pub fn from_utc(ts: DateTime<Utc>) -> Self {
        match ts.hour() {
            0..=6 => Self::Asian,
            7..=11 => Self::London,
            12..=15 => Self::Overlap,
            16..=20 => Self::NewYork,
            _ => Self::OffHours,
        }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asian => write!(f, "ASIAN"),
            Self::London => write!(f, "LONDON"),
            Self::Overlap => write!(f, "OVERLAP"),
            Self::NewYork => write!(f, "NEW_YORK"),
            Self::OffHours => write!(f, "OFF_HOURS"),
        }
    }
}

// =============================================================================
// MarketContext
// =============================================================================

/// Ephemeral market conditions for one symbol on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    /// ATR as a percentage of price.
    pub volatility: f64,
    /// Bid-ask spread in basis points.
    pub spread_bps: f64,
    /// Trend strength in [-1, 1]; positive = up-trend.
    pub trend_strength: f64,
    pub session: Session,
    pub news_event: bool,
    pub market_close_imminent: bool,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            volatility: 0.0,
            spread_bps: 0.0,
            trend_strength: 0.0,
            session: Session::OffHours,
            news_event: false,
            market_close_imminent: false,
        }
    }
}

impl MarketContext {
    /// Build a context from the indicator snapshot and the current spread.
    ///
    /// Missing indicators leave the corresponding field at its neutral value.
    pub fn from_indicators(indicators: &IndicatorSnapshot, spread_bps: f64, now: DateTime<Utc>) -> Self {
        let volatility = match (indicators.get(keys::ATR), indicators.get(keys::CLOSE)) {
            (Some(atr), Some(close)) if close > 0.0 => atr / close * 100.0,
            _ => 0.0,
        };

        let trend_strength = match (indicators.get(keys::EMA_FAST), indicators.get(keys::EMA_SLOW)) {
            (Some(fast), Some(slow)) if slow > 0.0 => {
                let separation_pct = (fast - slow) / slow * 100.0;
                (separation_pct / TREND_SEPARATION_SCALE_PCT).tanh()
            }
            _ => 0.0,
        };

        Self {
            volatility,
            spread_bps: spread_bps.max(0.0),
            trend_strength,
            session: Session::from_utc(now),
            news_event: false,
            market_close_imminent: false,
        }
    }

    pub fn with_news(mut self, news_event: bool) -> Self {
        self.news_event = news_event;
        self
    }

    pub fn with_market_close(mut self, imminent: bool) -> Self {
        self.market_close_imminent = imminent;
        self
    }
}

// =============================================================================
// PeakTracker — running excursion tracker keyed by ticket
// =============================================================================

/// Running maxima of favourable / adverse excursion for one ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeakTracker {
    /// Largest unrealized profit seen (currency, >= 0).
    pub max_favorable: f64,
    /// Largest unrealized loss seen (currency, >= 0).
    pub max_adverse: f64,
    /// Largest profit seen in percent of entry (>= 0).
    pub max_favorable_pct: f64,
    /// Largest loss seen in percent of entry (>= 0).
    pub max_adverse_pct: f64,
    pub observations: u64,
}

impl PeakTracker {
    pub fn observe(&mut self, position: &Position) {
        let pnl = position.unrealized_pnl;
        let pnl_pct = position.pnl_pct();

        self.max_favorable = self.max_favorable.max(pnl).max(position.peak_favorable);
        self.max_adverse = self.max_adverse.max(-pnl).max(position.peak_adverse);
        self.max_favorable_pct = self.max_favorable_pct.max(pnl_pct);
        self.max_adverse_pct = self.max_adverse_pct.max(-pnl_pct);
        self.observations += 1;
    }
}

// =============================================================================
// PositionContext
// =============================================================================

/// Per-tick view of a position's P&L trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionContext {
    pub unrealized_pnl: f64,
    pub pnl_pct: f64,
    pub holding_minutes: f64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
    pub max_favorable_pct: f64,
    pub max_adverse_pct: f64,
    pub in_profit: bool,
    pub in_loss: bool,
}

impl PositionContext {
    pub fn derive(position: &Position, peak: &PeakTracker, now: DateTime<Utc>) -> Self {
        let pnl = position.unrealized_pnl;
        Self {
            unrealized_pnl: pnl,
            pnl_pct: position.pnl_pct(),
            holding_minutes: position.holding_minutes(now),
            max_favorable_excursion: peak.max_favorable.max(pnl).max(0.0),
            max_adverse_excursion: peak.max_adverse.max(-pnl).max(0.0),
            max_favorable_pct: peak.max_favorable_pct.max(position.pnl_pct()).max(0.0),
            max_adverse_pct: peak.max_adverse_pct.max(-position.pnl_pct()).max(0.0),
            in_profit: pnl > 0.0,
            in_loss: pnl < 0.0,
        }
    }

    /// Fraction of the peak profit handed back, `None` before any profit.
    ///
    /// Measured on price (percent of entry), so a partial close at an
    /// unchanged price hands nothing back.
    pub fn giveback_fraction(&self) -> Option<f64> {
        if self.max_favorable_pct <= 0.0 {
            return None;
        }
        Some(((self.max_favorable_pct - self.pnl_pct) / self.max_favorable_pct).max(0.0))
    }
}

// =============================================================================
// Tests
// =============================================================================
