// =============================================================================
// Confluence Scorer — multi-indicator reversal agreement
// =============================================================================
//
// Up to six independent reversal signals are computed from the indicator
// snapshot (plus the position's profit giveback):
//
//   RSI        extreme reading turning back
//   MACD       line / signal crossover or fading histogram
//   Bollinger  close outside a band
//   Volume     climax volume against an extended move
//   Trend      fast / slow EMA flip
//   Giveback   share of peak profit handed back
//
// Only signals opposing the position contribute:
//
//   raw   = Σ weight × strength × confidence            (opposing signals)
//   score = raw / Σ weight                              (computable signals)
//   score ×= 1.2 when ≥3 agree, and ×= 1.1 more when ≥4 agree
//   score  = clamp(score, 0, 1)
//
// Classification (boundaries inclusive on the ≥ side):
//   score < scale_out            HOLD
//   scale_out ≤ score < close    SCALE_OUT
//   close ≤ score < emergency    CLOSE_NOW
//   emergency ≤ score            EMERGENCY
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ensure, ConfigError};
use crate::regime::remap;
use crate::types::{keys, IndicatorSnapshot, Side};

/// Weight-sum tolerance used by validation.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Signal types
// =============================================================================

/// Source of a confluence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Indicator {
    Rsi,
    Macd,
    Bollinger,
    Volume,
    Trend,
    Giveback,
}

impl std::fmt::Display for Indicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsi => write!(f, "RSI"),
            Self::Macd => write!(f, "MACD"),
            Self::Bollinger => write!(f, "BOLLINGER"),
            Self::Volume => write!(f, "VOLUME"),
            Self::Trend => write!(f, "TREND"),
            Self::Giveback => write!(f, "GIVEBACK"),
        }
    }
}

/// Which way an indicator says price is about to turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    ReversalUp,
    ReversalDown,
    Neutral,
}

impl SignalDirection {
    /// `true` when this direction works against a position on `side`.
    pub fn opposes(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Self::ReversalDown, Side::Long) | (Self::ReversalUp, Side::Short)
        )
    }

    /// Direction that works against `side`.
    pub fn against(side: Side) -> Self {
        match side {
            Side::Long => Self::ReversalDown,
            Side::Short => Self::ReversalUp,
        }
    }
}

/// One indicator's reversal reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceSignal {
    pub indicator: Indicator,
    pub direction: SignalDirection,
    /// 0–1
    pub strength: f64,
    /// 0–1
    pub confidence: f64,
}

impl ConfluenceSignal {
    pub fn new(indicator: Indicator, direction: SignalDirection, strength: f64, confidence: f64) -> Self {
        Self {
            indicator,
            direction,
            strength: strength.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    fn neutral(indicator: Indicator) -> Self {
        Self::new(indicator, SignalDirection::Neutral, 0.0, 0.5)
    }
}

/// Exit urgency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExitClass {
    Hold,
    ScaleOut,
    CloseNow,
    Emergency,
}

impl std::fmt::Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "HOLD"),
            Self::ScaleOut => write!(f, "SCALE_OUT"),
            Self::CloseNow => write!(f, "CLOSE_NOW"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-indicator weights; must sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceWeights {
    pub rsi: f64,
    pub macd: f64,
    pub bollinger: f64,
    pub volume: f64,
    pub trend: f64,
    pub giveback: f64,
}

impl Default for ConfluenceWeights {
    fn default() -> Self {
        Self {
            rsi: 0.20,
            macd: 0.20,
            bollinger: 0.15,
            volume: 0.10,
            trend: 0.20,
            giveback: 0.15,
        }
    }
}

impl ConfluenceWeights {
    pub fn weight(&self, indicator: Indicator) -> f64 {
        match indicator {
            Indicator::Rsi => self.rsi,
            Indicator::Macd => self.macd,
            Indicator::Bollinger => self.bollinger,
            Indicator::Volume => self.volume,
            Indicator::Trend => self.trend,
            Indicator::Giveback => self.giveback,
        }
    }

    fn all(&self) -> [f64; 6] {
        [self.rsi, self.macd, self.bollinger, self.volume, self.trend, self.giveback]
    }
}

fn default_scale_out() -> f64 {
    0.55
}
fn default_close_now() -> f64 {
    0.75
}
fn default_emergency() -> f64 {
    0.90
}
fn default_bonus_three() -> f64 {
    1.2
}
fn default_bonus_four() -> f64 {
    1.1
}
fn default_rsi_overbought() -> f64 {
    70.0
}
fn default_rsi_oversold() -> f64 {
    30.0
}
fn default_volume_spike_ratio() -> f64 {
    2.0
}
fn default_min_giveback() -> f64 {
    0.25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceConfig {
    #[serde(default)]
    pub weights: ConfluenceWeights,
    #[serde(default = "default_scale_out")]
    pub scale_out_threshold: f64,
    #[serde(default = "default_close_now")]
    pub close_now_threshold: f64,
    #[serde(default = "default_emergency")]
    pub emergency_threshold: f64,
    /// Multiplier applied when at least three signals agree.
    #[serde(default = "default_bonus_three")]
    pub agreement_bonus_three: f64,
    /// Additional multiplier applied when at least four signals agree.
    #[serde(default = "default_bonus_four")]
    pub agreement_bonus_four: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_volume_spike_ratio")]
    pub volume_spike_ratio: f64,
    /// Giveback fraction below which the giveback signal stays neutral.
    #[serde(default = "default_min_giveback")]
    pub min_giveback: f64,
}

impl Default for ConfluenceConfig {
    fn default() -> Self {
        Self {
            weights: ConfluenceWeights::default(),
            scale_out_threshold: default_scale_out(),
            close_now_threshold: default_close_now(),
            emergency_threshold: default_emergency(),
            agreement_bonus_three: default_bonus_three(),
            agreement_bonus_four: default_bonus_four(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            volume_spike_ratio: default_volume_spike_ratio(),
            min_giveback: default_min_giveback(),
        }
    }
}

impl ConfluenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = self.weights.all();
        let sum: f64 = weights.iter().sum();
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Weights {
                component: "confluence".into(),
            });
        }
        ensure(
            0.0 < self.scale_out_threshold
                && self.scale_out_threshold < self.close_now_threshold
                && self.close_now_threshold < self.emergency_threshold
                && self.emergency_threshold <= 1.0,
            "confluence.thresholds",
            "must be strictly increasing within (0, 1]",
        )?;
        ensure(
            self.agreement_bonus_three >= 1.0 && self.agreement_bonus_four >= 1.0,
            "confluence.agreement_bonus",
            "must be >= 1.0",
        )?;
        ensure(
            self.rsi_oversold < self.rsi_overbought && self.rsi_overbought < 100.0 && self.rsi_oversold > 0.0,
            "confluence.rsi_levels",
            "need 0 < oversold < overbought < 100",
        )?;
        ensure(self.volume_spike_ratio > 1.0, "confluence.volume_spike_ratio", "must exceed 1.0")?;
        ensure(
            (0.0..1.0).contains(&self.min_giveback),
            "confluence.min_giveback",
            "must be in [0, 1)",
        )
    }
}

// =============================================================================
// Scorer
// =============================================================================

/// Result of one scoring pass.
#[derive(Debug, Clone, Serialize)]
pub struct ConfluenceReport {
    pub score: f64,
    pub class: ExitClass,
    /// Signals opposing the position.
    pub agreeing: usize,
    /// Signals that could be computed.
    pub available: usize,
    pub signals: Vec<ConfluenceSignal>,
}

impl ConfluenceReport {
    /// Comma-separated names of the agreeing indicators.
    pub fn agreeing_names(&self, side: Side) -> String {
        self.signals
            .iter()
            .filter(|s| s.direction.opposes(side))
            .map(|s| s.indicator.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Stateless reversal aggregator.
#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    config: ConfluenceConfig,
}

impl ConfluenceScorer {
    pub fn new(config: ConfluenceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ConfluenceConfig {
        &self.config
    }

    /// Classify a score against the configured thresholds.
    pub fn classify(&self, score: f64) -> ExitClass {
        let c = &self.config;
        if score >= c.emergency_threshold {
            ExitClass::Emergency
        } else if score >= c.close_now_threshold {
            ExitClass::CloseNow
        } else if score >= c.scale_out_threshold {
            ExitClass::ScaleOut
        } else {
            ExitClass::Hold
        }
    }

    /// Combine `signals` for a position on `side`.
    pub fn score(&self, signals: &[ConfluenceSignal], side: Side) -> ConfluenceReport {
        let weights = &self.config.weights;
        let total_weight: f64 = signals.iter().map(|s| weights.weight(s.indicator)).sum();

        let mut raw = 0.0;
        let mut agreeing = 0;
        for s in signals.iter().filter(|s| s.direction.opposes(side)) {
            raw += weights.weight(s.indicator) * s.strength * s.confidence;
            agreeing += 1;
        }

        let mut score = if total_weight > 0.0 { raw / total_weight } else { 0.0 };
        if agreeing >= 3 {
            score *= self.config.agreement_bonus_three;
        }
        if agreeing >= 4 {
            score *= self.config.agreement_bonus_four;
        }
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };

        ConfluenceReport {
            score,
            class: self.classify(score),
            agreeing,
            available: signals.len(),
            signals: signals.to_vec(),
        }
    }

    /// Compute every signal the snapshot allows. Missing inputs skip the
    /// signal entirely; present-but-quiet inputs yield a neutral signal.
    pub fn collect_signals(
        &self,
        indicators: &IndicatorSnapshot,
        side: Side,
        giveback: Option<f64>,
    ) -> Vec<ConfluenceSignal> {
        [
            self.rsi_signal(indicators),
            self.macd_signal(indicators),
            self.bollinger_signal(indicators),
            self.volume_signal(indicators),
            self.trend_signal(indicators),
            self.giveback_signal(side, giveback),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Collect and score in one call.
    pub fn evaluate(&self, indicators: &IndicatorSnapshot, side: Side, giveback: Option<f64>) -> ConfluenceReport {
        let signals = self.collect_signals(indicators, side, giveback);
        let report = self.score(&signals, side);
        debug!(
            side = %side,
            score = format!("{:.3}", report.score),
            class = %report.class,
            agreeing = report.agreeing,
            available = report.available,
            "Confluence evaluated"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Individual signals
    // -------------------------------------------------------------------------

    fn rsi_signal(&self, ind: &IndicatorSnapshot) -> Option<ConfluenceSignal> {
        let rsi = ind.get(keys::RSI)?;
        let prev = ind.get(keys::RSI_PREV);
        let (ob, os) = (self.config.rsi_overbought, self.config.rsi_oversold);

        let peak = prev.map_or(rsi, |p| p.max(rsi));
        let trough = prev.map_or(rsi, |p| p.min(rsi));

        if peak >= ob {
            let turning = prev.is_some_and(|p| rsi < p);
            let strength = 0.5 + 0.5 * remap(peak, ob, 100.0, 0.0, 1.0);
            let confidence = if turning { 0.8 } else { 0.5 };
            return Some(ConfluenceSignal::new(Indicator::Rsi, SignalDirection::ReversalDown, strength, confidence));
        }
        if trough <= os {
            let turning = prev.is_some_and(|p| rsi > p);
            let strength = 0.5 + 0.5 * remap(trough, os, 0.0, 0.0, 1.0);
            let confidence = if turning { 0.8 } else { 0.5 };
            return Some(ConfluenceSignal::new(Indicator::Rsi, SignalDirection::ReversalUp, strength, confidence));
        }
        Some(ConfluenceSignal::neutral(Indicator::Rsi))
    }

    fn macd_signal(&self, ind: &IndicatorSnapshot) -> Option<ConfluenceSignal> {
        let macd = ind.get(keys::MACD)?;
        let signal = ind.get(keys::MACD_SIGNAL)?;
        let hist = macd - signal;

        if let Some(prev) = ind.get(keys::MACD_PREV) {
            let prev_hist = prev - signal;
            if prev_hist > 0.0 && hist <= 0.0 {
                return Some(ConfluenceSignal::new(Indicator::Macd, SignalDirection::ReversalDown, 0.8, 0.75));
            }
            if prev_hist < 0.0 && hist >= 0.0 {
                return Some(ConfluenceSignal::new(Indicator::Macd, SignalDirection::ReversalUp, 0.8, 0.75));
            }
            // Histogram fading towards a cross.
            if hist > 0.0 && macd < prev {
                return Some(ConfluenceSignal::new(Indicator::Macd, SignalDirection::ReversalDown, 0.4, 0.5));
            }
            if hist < 0.0 && macd > prev {
                return Some(ConfluenceSignal::new(Indicator::Macd, SignalDirection::ReversalUp, 0.4, 0.5));
            }
        }
        Some(ConfluenceSignal::neutral(Indicator::Macd))
    }

    fn bollinger_signal(&self, ind: &IndicatorSnapshot) -> Option<ConfluenceSignal> {
        let close = ind.get(keys::CLOSE)?;
        let upper = ind.get(keys::BB_UPPER)?;
        let lower = ind.get(keys::BB_LOWER)?;
        let width = upper - lower;
        if width <= 0.0 {
            return None;
        }

        if close >= upper {
            let strength = 0.6 + 0.4 * remap(close - upper, 0.0, width * 0.25, 0.0, 1.0);
            return Some(ConfluenceSignal::new(Indicator::Bollinger, SignalDirection::ReversalDown, strength, 0.7));
        }
        if close <= lower {
            let strength = 0.6 + 0.4 * remap(lower - close, 0.0, width * 0.25, 0.0, 1.0);
            return Some(ConfluenceSignal::new(Indicator::Bollinger, SignalDirection::ReversalUp, strength, 0.7));
        }
        Some(ConfluenceSignal::neutral(Indicator::Bollinger))
    }

    fn volume_signal(&self, ind: &IndicatorSnapshot) -> Option<ConfluenceSignal> {
        let volume = ind.get(keys::VOLUME)?;
        let avg = ind.get(keys::VOLUME_AVG)?;
        if avg <= 0.0 {
            return None;
        }
        let ratio = volume / avg;
        if ratio < self.config.volume_spike_ratio {
            return Some(ConfluenceSignal::neutral(Indicator::Volume));
        }

        // Climax volume reads as exhaustion of the prevailing move.
        let direction = match (ind.get(keys::CLOSE), ind.get(keys::EMA_FAST)) {
            (Some(close), Some(ema)) if close > ema => SignalDirection::ReversalDown,
            (Some(close), Some(ema)) if close < ema => SignalDirection::ReversalUp,
            _ => SignalDirection::Neutral,
        };
        let strength = remap(ratio, 1.0, self.config.volume_spike_ratio * 2.0, 0.3, 1.0);
        Some(ConfluenceSignal::new(Indicator::Volume, direction, strength, 0.6))
    }

    fn trend_signal(&self, ind: &IndicatorSnapshot) -> Option<ConfluenceSignal> {
        let fast = ind.get(keys::EMA_FAST)?;
        let slow = ind.get(keys::EMA_SLOW)?;

        match (ind.get(keys::EMA_FAST_PREV), ind.get(keys::EMA_SLOW_PREV)) {
            (Some(fast_prev), Some(slow_prev)) => {
                if fast_prev >= slow_prev && fast < slow {
                    Some(ConfluenceSignal::new(Indicator::Trend, SignalDirection::ReversalDown, 0.9, 0.8))
                } else if fast_prev <= slow_prev && fast > slow {
                    Some(ConfluenceSignal::new(Indicator::Trend, SignalDirection::ReversalUp, 0.9, 0.8))
                } else {
                    Some(ConfluenceSignal::neutral(Indicator::Trend))
                }
            }
            // No history: report the current alignment with low conviction.
            _ if fast < slow => Some(ConfluenceSignal::new(Indicator::Trend, SignalDirection::ReversalDown, 0.5, 0.5)),
            _ if fast > slow => Some(ConfluenceSignal::new(Indicator::Trend, SignalDirection::ReversalUp, 0.5, 0.5)),
            _ => Some(ConfluenceSignal::neutral(Indicator::Trend)),
        }
    }

    fn giveback_signal(&self, side: Side, giveback: Option<f64>) -> Option<ConfluenceSignal> {
        let g = giveback?;
        if g < self.config.min_giveback {
            return Some(ConfluenceSignal::neutral(Indicator::Giveback));
        }
        let strength = remap(g, self.config.min_giveback, 1.0, 0.4, 1.0);
        Some(ConfluenceSignal::new(Indicator::Giveback, SignalDirection::against(side), strength, 0.7))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> ConfluenceScorer {
        ConfluenceScorer::new(ConfluenceConfig::default()).unwrap()
    }

    fn down(indicator: Indicator, strength: f64, confidence: f64) -> ConfluenceSignal {
        ConfluenceSignal::new(indicator, SignalDirection::ReversalDown, strength, confidence)
    }

    #[test]
    fn four_agreeing_signals_close_now() {
        let signals = vec![
            down(Indicator::Rsi, 0.8, 0.8),
            down(Indicator::Macd, 0.8, 0.8),
            down(Indicator::Bollinger, 0.8, 0.8),
            down(Indicator::Trend, 0.8, 0.8),
        ];
        let report = scorer().score(&signals, Side::Long);
        assert_eq!(report.agreeing, 4);
        assert!((report.score - 0.64 * 1.2 * 1.1).abs() < 1e-9, "score {}", report.score);
        assert_eq!(report.class, ExitClass::CloseNow);
    }

    #[test]
    fn signals_with_the_position_do_not_count() {
        let signals = vec![down(Indicator::Rsi, 1.0, 1.0), down(Indicator::Macd, 1.0, 1.0)];
        let report = scorer().score(&signals, Side::Short);
        assert_eq!(report.agreeing, 0);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.class, ExitClass::Hold);
    }

    #[test]
    fn classification_boundaries_are_inclusive() {
        let s = scorer();
        assert_eq!(s.classify(0.5499), ExitClass::Hold);
        assert_eq!(s.classify(0.55), ExitClass::ScaleOut);
        assert_eq!(s.classify(0.75), ExitClass::CloseNow);
        assert_eq!(s.classify(0.90), ExitClass::Emergency);
        assert_eq!(s.classify(1.0), ExitClass::Emergency);
    }

    #[test]
    fn score_is_clamped() {
        let signals: Vec<ConfluenceSignal> = [
            Indicator::Rsi,
            Indicator::Macd,
            Indicator::Bollinger,
            Indicator::Volume,
            Indicator::Trend,
            Indicator::Giveback,
        ]
        .into_iter()
        .map(|i| down(i, 1.0, 1.0))
        .collect();
        let report = scorer().score(&signals, Side::Long);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.class, ExitClass::Emergency);
    }

    #[test]
    fn collect_from_overbought_snapshot() {
        let ind = IndicatorSnapshot::new()
            .with(keys::RSI, 74.0)
            .with(keys::RSI_PREV, 82.0)
            .with(keys::MACD, 0.9)
            .with(keys::MACD_SIGNAL, 1.0)
            .with(keys::MACD_PREV, 1.2)
            .with(keys::CLOSE, 106.0)
            .with(keys::BB_UPPER, 105.0)
            .with(keys::BB_LOWER, 95.0)
            .with(keys::EMA_FAST, 104.0)
            .with(keys::EMA_SLOW, 104.5)
            .with(keys::EMA_FAST_PREV, 105.0)
            .with(keys::EMA_SLOW_PREV, 104.4);
        let report = scorer().evaluate(&ind, Side::Long, Some(0.1));
        // volume missing -> five computable signals
        assert_eq!(report.available, 5);
        assert_eq!(report.agreeing, 4);
        assert!(report.class >= ExitClass::ScaleOut, "class {}", report.class);
        assert!(report.agreeing_names(Side::Long).contains("TREND"));
    }

    #[test]
    fn empty_snapshot_holds() {
        let report = scorer().evaluate(&IndicatorSnapshot::new(), Side::Long, None);
        assert_eq!(report.available, 0);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.class, ExitClass::Hold);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = ConfluenceConfig::default();
        cfg.weights.rsi = 0.5;
        assert!(matches!(ConfluenceScorer::new(cfg), Err(ConfigError::Weights { .. })));

        let cfg = ConfluenceConfig {
            close_now_threshold: 0.5,
            ..ConfluenceConfig::default()
        };
        assert!(ConfluenceScorer::new(cfg).is_err());
    }
}
