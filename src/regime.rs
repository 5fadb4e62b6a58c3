// =============================================================================
// Market Regime Classification
// =============================================================================
//
// Classifies the current market into one of five regimes from the per-tick
// MarketContext. The selector's regime-affinity table and its regime-scoped
// performance statistics are keyed by the result.
//
// Classification hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. DEAD      — volatility below the dead floor and no trend
//   2. VOLATILE  — volatility above the expansion ceiling
//   3. SQUEEZE   — low volatility and weak trend (compression)
//   4. TRENDING  — |trend strength| above the trending threshold
//   5. RANGING   — everything else
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::context::MarketContext;
use crate::error::{ensure, ConfigError};

/// Coarse market state used to weight exit styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Directional; trailing exits keep the position riding.
    Trending,
    /// Two-sided chop; targets get hit and reversed.
    Ranging,
    /// Volatility expansion; loss cuts matter most.
    Volatile,
    /// Quiet compression ahead of a breakout.
    Squeeze,
    /// Barely moving market, no edge either way.
    Dead,
}

impl MarketRegime {
    pub const ALL: [MarketRegime; 5] = [
        Self::Trending,
        Self::Ranging,
        Self::Volatile,
        Self::Squeeze,
        Self::Dead,
    ];
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::Squeeze => write!(f, "SQUEEZE"),
            Self::Dead => write!(f, "DEAD"),
        }
    }
}

fn default_trending_strength() -> f64 {
    0.5
}

fn default_volatile_above() -> f64 {
    2.0
}

fn default_squeeze_below() -> f64 {
    0.3
}

fn default_dead_below() -> f64 {
    0.05
}

/// Thresholds for [`classify`]. Volatility values are ATR as % of price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    #[serde(default = "default_trending_strength")]
    pub trending_strength: f64,
    #[serde(default = "default_volatile_above")]
    pub volatile_above: f64,
    #[serde(default = "default_squeeze_below")]
    pub squeeze_below: f64,
    #[serde(default = "default_dead_below")]
    pub dead_below: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            trending_strength: default_trending_strength(),
            volatile_above: default_volatile_above(),
            squeeze_below: default_squeeze_below(),
            dead_below: default_dead_below(),
        }
    }
}

impl RegimeThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.trending_strength > 0.0 && self.trending_strength <= 1.0,
            "regime.trending_strength",
            "must be in (0, 1]",
        )?;
        ensure(
            self.dead_below >= 0.0 && self.dead_below < self.squeeze_below,
            "regime.dead_below",
            "must be >= 0 and below squeeze_below",
        )?;
        ensure(
            self.squeeze_below < self.volatile_above,
            "regime.squeeze_below",
            "must be below volatile_above",
        )
    }
}

/// Determine the regime and a confidence score from the market context.
pub fn classify(ctx: &MarketContext, t: &RegimeThresholds) -> (MarketRegime, f64) {
    let vol = ctx.volatility.max(0.0);
    let trend = ctx.trend_strength.abs();

    if vol < t.dead_below && trend < t.trending_strength * 0.4 {
        return (MarketRegime::Dead, remap(vol, t.dead_below, 0.0, 0.6, 1.0));
    }

    if vol > t.volatile_above {
        let confidence = remap(vol, t.volatile_above, t.volatile_above * 2.0, 0.65, 1.0);
        return (MarketRegime::Volatile, confidence);
    }

    if vol < t.squeeze_below && trend < t.trending_strength * 0.6 {
        let confidence = remap(vol, t.squeeze_below, t.dead_below, 0.5, 1.0);
        return (MarketRegime::Squeeze, confidence);
    }

    if trend >= t.trending_strength {
        return (MarketRegime::Trending, remap(trend, t.trending_strength, 1.0, 0.6, 1.0));
    }

    trace!(
        volatility = format!("{:.4}", vol),
        trend = format!("{:.2}", ctx.trend_strength),
        "Regime: no rule matched, defaulting to RANGING"
    );
    (MarketRegime::Ranging, remap(trend, t.trending_strength, 0.0, 0.3, 0.8))
}

/// Map `value` linearly from `[in_lo, in_hi]` onto `[out_lo, out_hi]` and clamp.
/// Either range may be descending.
pub(crate) fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let span = in_hi - in_lo;
    let frac = if span.abs() < f64::EPSILON { 0.5 } else { (value - in_lo) / span };
    out_lo + frac.clamp(0.0, 1.0) * (out_hi - out_lo)
}
