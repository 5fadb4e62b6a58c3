// =============================================================================
// DynamicExitSelector — utility-scored choice among triggered strategies
// =============================================================================
//
// Every strategy runs; those that produced a signal become candidates. Each
// candidate gets five components in [0, 1]:
//
//   pnl         does the strategy's style fit the position's P&L direction?
//   risk        does it fit current volatility / adverse excursion?
//   time        holding-time opportunity cost
//   regime      style × market-regime affinity table
//   confidence  rolling success history (with a prior) blended with the
//               signal's own confidence
//
// utility = Σ wᵢ·cᵢ with weights normalised to 1. The argmax is returned
// only if its utility clears `min_utility`. Otherwise the best candidate at
// or above `bypass_priority` is returned, if there is one.
//
// Performance history is kept per strategy, globally and per regime, in
// fixed-size rolling windows.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::coordinator::{forward_outcome, release_losers, run_strategies, Triggered};
use super::strategy::{ExitStrategy, ExitStyle};
use crate::context::{MarketContext, PositionContext};
use crate::error::{ensure, ConfigError};
use crate::execution::CloseResult;
use crate::regime::{classify, remap, MarketRegime, RegimeThresholds};
use crate::state::PositionArena;
use crate::telemetry::{SharedSink, TelemetryEvent};
use crate::types::{ExitDecision, MarketData, Position, Ticket};

// =============================================================================
// Config
// =============================================================================

fn default_pnl_weight() -> f64 {
    0.25
}
fn default_risk_weight() -> f64 {
    0.20
}
fn default_time_weight() -> f64 {
    0.15
}
fn default_regime_weight() -> f64 {
    0.20
}
fn default_confidence_weight() -> f64 {
    0.20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilityWeights {
    #[serde(default = "default_pnl_weight")]
    pub pnl: f64,
    #[serde(default = "default_risk_weight")]
    pub risk: f64,
    #[serde(default = "default_time_weight")]
    pub time: f64,
    #[serde(default = "default_regime_weight")]
    pub regime: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence: f64,
}

impl Default for UtilityWeights {
    fn default() -> Self {
        Self {
            pnl: default_pnl_weight(),
            risk: default_risk_weight(),
            time: default_time_weight(),
            regime: default_regime_weight(),
            confidence: default_confidence_weight(),
        }
    }
}

impl UtilityWeights {
    fn as_array(&self) -> [f64; 5] {
        [self.pnl, self.risk, self.time, self.regime, self.confidence]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = self.as_array();
        if w.iter().any(|x| *x < 0.0 || !x.is_finite()) || w.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Weights {
                component: "selector.weights".into(),
            });
        }
        Ok(())
    }

    /// Weights scaled to sum to 1.
    pub fn normalized(&self) -> [f64; 5] {
        let w = self.as_array();
        let total: f64 = w.iter().sum();
        w.map(|x| x / total)
    }
}

fn default_min_utility() -> f64 {
    0.6
}
fn default_window() -> usize {
    50
}
fn default_min_regime_samples() -> usize {
    5
}
fn default_prior_weight() -> f64 {
    4.0
}
fn default_prior_success() -> f64 {
    0.5
}
fn default_improvement_scale() -> f64 {
    10.0
}
fn default_long_hold_minutes() -> f64 {
    240.0
}
fn default_bypass_priority() -> Option<u8> {
    Some(100)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub weights: UtilityWeights,
    #[serde(default = "default_min_utility")]
    pub min_utility: f64,
    /// Rolling window length per strategy (and per regime).
    #[serde(default = "default_window")]
    pub window: usize,
    /// Regime-scoped history is used once it has this many samples.
    #[serde(default = "default_min_regime_samples")]
    pub min_regime_samples: usize,
    /// Pseudo-observations behind the prior success rate.
    #[serde(default = "default_prior_weight")]
    pub prior_weight: f64,
    #[serde(default = "default_prior_success")]
    pub prior_success: f64,
    /// P&L improvement (account currency) that maps to tanh(1).
    #[serde(default = "default_improvement_scale")]
    pub improvement_scale: f64,
    #[serde(default = "default_long_hold_minutes")]
    pub long_hold_minutes: f64,
    /// Signals at or above this priority skip the utility threshold.
    #[serde(default = "default_bypass_priority")]
    pub bypass_priority: Option<u8>,
    #[serde(default)]
    pub regime: RegimeThresholds,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: UtilityWeights::default(),
            min_utility: default_min_utility(),
            window: default_window(),
            min_regime_samples: default_min_regime_samples(),
            prior_weight: default_prior_weight(),
            prior_success: default_prior_success(),
            improvement_scale: default_improvement_scale(),
            long_hold_minutes: default_long_hold_minutes(),
            bypass_priority: default_bypass_priority(),
            regime: RegimeThresholds::default(),
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        ensure(
            (0.0..=1.0).contains(&self.min_utility),
            "selector.min_utility",
            "must be in [0, 1]",
        )?;
        ensure(self.window > 0, "selector.window", "must be positive")?;
        ensure(self.prior_weight >= 0.0, "selector.prior_weight", "must be >= 0")?;
        ensure(
            (0.0..=1.0).contains(&self.prior_success),
            "selector.prior_success",
            "must be in [0, 1]",
        )?;
        ensure(self.improvement_scale > 0.0, "selector.improvement_scale", "must be positive")?;
        ensure(self.long_hold_minutes > 0.0, "selector.long_hold_minutes", "must be positive")?;
        self.regime.validate()
    }
}

/// How well each exit style suits each regime.
pub fn regime_affinity(style: ExitStyle, regime: MarketRegime) -> f64 {
    use ExitStyle::*;
    use MarketRegime::*;
    match (regime, style) {
        (Trending, LossCut) => 0.5,
        (Trending, Protective) => 0.9,
        (Trending, ProfitTake) => 0.5,
        (Trending, Timing) => 0.3,
        (Trending, Signal) => 0.6,

        (Ranging, LossCut) => 0.5,
        (Ranging, Protective) => 0.5,
        (Ranging, ProfitTake) => 0.9,
        (Ranging, Timing) => 0.6,
        (Ranging, Signal) => 0.7,

        (Volatile, LossCut) => 0.9,
        (Volatile, Protective) => 0.8,
        (Volatile, ProfitTake) => 0.6,
        (Volatile, Timing) => 0.4,
        (Volatile, Signal) => 0.6,

        (Squeeze, LossCut) => 0.6,
        (Squeeze, Protective) => 0.6,
        (Squeeze, ProfitTake) => 0.5,
        (Squeeze, Timing) => 0.7,
        (Squeeze, Signal) => 0.8,

        (Dead, LossCut) => 0.4,
        (Dead, Protective) => 0.4,
        (Dead, ProfitTake) => 0.6,
        (Dead, Timing) => 0.9,
        (Dead, Signal) => 0.5,
    }
}

// =============================================================================
// Performance history
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Sample {
    beneficial: bool,
    improvement: f64,
}

#[derive(Debug, Clone, Default)]
struct StrategyStats {
    global: VecDeque<Sample>,
    by_regime: HashMap<MarketRegime, VecDeque<Sample>>,
}

fn push_bounded(window: &mut VecDeque<Sample>, sample: Sample, cap: usize) {
    window.push_back(sample);
    while window.len() > cap {
        window.pop_front();
    }
}

/// Read-only view of a strategy's history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub samples: usize,
    pub success_rate: f64,
    pub mean_improvement: f64,
}

fn summarize(samples: &VecDeque<Sample>, prior_weight: f64, prior_success: f64) -> PerformanceSummary {
    let n = samples.len();
    let wins = samples.iter().filter(|s| s.beneficial).count() as f64;
    let mean_improvement = if n == 0 {
        0.0
    } else {
        samples.iter().map(|s| s.improvement).sum::<f64>() / n as f64
    };
    let denom = n as f64 + prior_weight;
    let success_rate = if denom > 0.0 {
        (wins + prior_weight * prior_success) / denom
    } else {
        prior_success
    };
    PerformanceSummary {
        samples: n,
        success_rate,
        mean_improvement,
    }
}

// =============================================================================
// Utility
// =============================================================================

/// Per-component utility of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilityBreakdown {
    pub pnl: f64,
    pub risk: f64,
    pub time: f64,
    pub regime: f64,
    pub confidence: f64,
    pub total: f64,
}

// =============================================================================
// Selector
// =============================================================================

pub struct DynamicExitSelector {
    strategies: Vec<Arc<dyn ExitStrategy>>,
    config: SelectorConfig,
    weights: [f64; 5],
    arena: Arc<PositionArena>,
    stats: RwLock<HashMap<String, StrategyStats>>,
    sink: SharedSink,
}

impl DynamicExitSelector {
    pub fn new(config: SelectorConfig, sink: SharedSink) -> Result<Self, ConfigError> {
        Self::with_arena(config, Arc::new(PositionArena::new()), sink)
    }

    pub fn with_arena(config: SelectorConfig, arena: Arc<PositionArena>, sink: SharedSink) -> Result<Self, ConfigError> {
        config.validate()?;
        let weights = config.weights.normalized();
        Ok(Self {
            strategies: Vec::new(),
            config,
            weights,
            arena,
            stats: RwLock::new(HashMap::new()),
            sink,
        })
    }

    pub fn register(&mut self, strategy: Arc<dyn ExitStrategy>) -> Result<(), ConfigError> {
        if self.strategies.iter().any(|s| s.name() == strategy.name()) {
            return Err(ConfigError::invalid(
                "strategies",
                format!("duplicate strategy name `{}`", strategy.name()),
            ));
        }
        info!(strategy = strategy.name(), style = ?strategy.kind().style(), "Selector candidate registered");
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn strategies(&self) -> &[Arc<dyn ExitStrategy>] {
        &self.strategies
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arc<PositionArena> {
        &self.arena
    }

    pub fn observe(&self, position: &Position, now: DateTime<Utc>) -> PositionContext {
        self.arena.observe(position, now)
    }

    pub fn regime(&self, market: &MarketContext) -> MarketRegime {
        classify(market, &self.config.regime).0
    }

    /// History for `strategy`, regime-scoped when that regime has enough samples.
    pub fn performance(&self, strategy: &str, regime: Option<MarketRegime>) -> PerformanceSummary {
        let cfg = &self.config;
        let stats = self.stats.read();
        let empty = VecDeque::new();
        let samples = stats.get(strategy).map_or(&empty, |s| {
            regime
                .and_then(|r| s.by_regime.get(&r))
                .filter(|w| w.len() >= cfg.min_regime_samples)
                .unwrap_or(&s.global)
        });
        summarize(samples, cfg.prior_weight, cfg.prior_success)
    }

    /// Record whether acting on `strategy` helped.
    pub fn update_performance(&self, strategy: &str, was_beneficial: bool, pnl_improvement: f64, regime: MarketRegime) {
        let cap = self.config.window;
        let sample = Sample {
            beneficial: was_beneficial,
            improvement: if pnl_improvement.is_finite() { pnl_improvement } else { 0.0 },
        };
        let mut stats = self.stats.write();
        let entry = stats.entry(strategy.to_string()).or_default();
        push_bounded(&mut entry.global, sample, cap);
        push_bounded(entry.by_regime.entry(regime).or_default(), sample, cap);
        debug!(strategy, was_beneficial, pnl_improvement, regime = %regime, "Selector performance updated");
    }

    fn pnl_component(style: ExitStyle, pc: &PositionContext) -> f64 {
        match style {
            ExitStyle::LossCut if pc.in_loss => remap(-pc.pnl_pct, 0.0, 2.0, 0.5, 1.0),
            ExitStyle::LossCut => 0.2,
            ExitStyle::ProfitTake if pc.in_profit => remap(pc.pnl_pct, 0.0, 2.0, 0.5, 1.0),
            ExitStyle::ProfitTake => 0.1,
            ExitStyle::Protective => match pc.giveback_fraction() {
                Some(g) if pc.in_profit => 0.5 + 0.5 * g.min(1.0),
                _ if pc.in_profit => 0.5,
                _ => 0.3,
            },
            ExitStyle::Timing => 0.5,
            ExitStyle::Signal if pc.in_profit => 0.7,
            ExitStyle::Signal => 0.5,
        }
    }

    fn risk_component(&self, style: ExitStyle, market: &MarketContext, pc: &PositionContext) -> f64 {
        let high = self.config.regime.volatile_above;
        match style {
            ExitStyle::LossCut => remap(market.volatility, 0.0, high, 0.3, 1.0)
                .max(remap(pc.max_adverse_pct, 0.0, 2.0, 0.0, 1.0)),
            ExitStyle::Protective => remap(market.volatility, 0.0, high, 0.3, 1.0),
            ExitStyle::ProfitTake => remap(market.volatility, 0.0, high, 0.7, 0.4),
            ExitStyle::Timing | ExitStyle::Signal => 0.5,
        }
    }

    fn time_component(&self, style: ExitStyle, pc: &PositionContext) -> f64 {
        let t = remap(pc.holding_minutes, 0.0, self.config.long_hold_minutes, 0.0, 1.0);
        match style {
            ExitStyle::Timing => t,
            ExitStyle::LossCut | ExitStyle::Signal => 0.5 + 0.3 * t,
            ExitStyle::ProfitTake | ExitStyle::Protective => 0.4 + 0.4 * t,
        }
    }

    fn confidence_component(&self, strategy: &str, regime: MarketRegime, signal_confidence: f64) -> f64 {
        let perf = self.performance(strategy, Some(regime));
        let squashed = 0.5 + 0.5 * (perf.mean_improvement / self.config.improvement_scale).tanh();
        let history = 0.7 * perf.success_rate + 0.3 * squashed;
        (0.6 * history + 0.4 * signal_confidence.clamp(0.0, 1.0)).clamp(0.0, 1.0)
    }

    /// Utility of `strategy`'s signal under the given conditions.
    pub fn utility(
        &self,
        strategy: &dyn ExitStrategy,
        signal_confidence: f64,
        market: &MarketContext,
        pc: &PositionContext,
        regime: MarketRegime,
    ) -> UtilityBreakdown {
        let style = strategy.kind().style();
        let pnl = Self::pnl_component(style, pc);
        let risk = self.risk_component(style, market, pc);
        let time = self.time_component(style, pc);
        let regime_fit = regime_affinity(style, regime);
        let confidence = self.confidence_component(strategy.name(), regime, signal_confidence);

        let w = self.weights;
        let total = w[0] * pnl + w[1] * risk + w[2] * time + w[3] * regime_fit + w[4] * confidence;
        UtilityBreakdown {
            pnl,
            risk,
            time,
            regime: regime_fit,
            confidence,
            total: total.clamp(0.0, 1.0),
        }
    }

    /// Argmax-utility exit for `position`, if it clears the threshold.
    pub fn select(
        &self,
        position: &Position,
        market: &MarketContext,
        position_ctx: &PositionContext,
        data: &MarketData,
    ) -> Option<ExitDecision> {
        let regime = self.regime(market);
        let order: Vec<(usize, Arc<dyn ExitStrategy>)> =
            self.strategies.iter().cloned().enumerate().collect();
        let mut triggered = run_strategies(&order, &self.arena, &self.sink, position, market, position_ctx, data);
        if triggered.is_empty() {
            debug!(ticket = position.ticket, "No selector candidate triggered");
            return None;
        }

        let scored: Vec<UtilityBreakdown> = triggered
            .iter()
            .map(|t| self.utility(t.strategy.as_ref(), t.signal.confidence, market, position_ctx, regime))
            .collect();

        // Highest utility, then signal priority, then registration order.
        let argmax = |eligible: &dyn Fn(&Triggered) -> bool| -> Option<usize> {
            let mut best: Option<usize> = None;
            for (idx, t) in triggered.iter().enumerate().filter(|(_, t)| eligible(*t)) {
                let better = match best {
                    None => true,
                    Some(b) => {
                        let (a, cur) = (&scored[idx], &scored[b]);
                        let tb = &triggered[b];
                        a.total > cur.total
                            || (a.total == cur.total
                                && (t.signal.priority > tb.signal.priority
                                    || (t.signal.priority == tb.signal.priority && t.order < tb.order)))
                    }
                };
                if better {
                    best = Some(idx);
                }
            }
            best
        };

        let top = argmax(&|_: &Triggered| true)?;
        let best = if scored[top].total >= self.config.min_utility {
            top
        } else {
            let bypass = self
                .config
                .bypass_priority
                .and_then(|p| argmax(&|t: &Triggered| t.signal.priority >= p));
            match bypass {
                Some(idx) => {
                    debug!(
                        ticket = position.ticket,
                        strategy = triggered[idx].strategy.name(),
                        priority = triggered[idx].signal.priority,
                        "Utility threshold bypassed by priority"
                    );
                    idx
                }
                None => {
                    debug!(
                        ticket = position.ticket,
                        strategy = triggered[top].strategy.name(),
                        utility = format!("{:.3}", scored[top].total),
                        min = self.config.min_utility,
                        "Best candidate below utility threshold"
                    );
                    release_losers(&self.arena, position.ticket, &triggered);
                    return None;
                }
            }
        };
        let utility = scored[best];

        let winner: Triggered = triggered.swap_remove(best);
        release_losers(&self.arena, position.ticket, &triggered);

        let priority = winner.signal.priority;
        let decision = ExitDecision {
            base_priority: winner.strategy.base_priority(),
            priority,
            adjustments: vec![
                format!("utility={:.3}", utility.total),
                format!("regime={}", regime),
            ],
            signal: winner.signal,
        };

        info!(
            ticket = position.ticket,
            strategy = decision.strategy(),
            utility = format!("{:.3}", utility.total),
            regime = %regime,
            reason = %decision.signal.reason,
            "Selector exit decision"
        );
        self.sink.record(TelemetryEvent::DecisionTriggered {
            ticket: position.ticket,
            strategy: decision.strategy().to_string(),
            reason: decision.signal.reason.clone(),
            priority: decision.priority,
            base_priority: decision.base_priority,
            volume: decision.signal.volume(),
            at: data.now,
        });
        Some(decision)
    }

    /// Route an execution result to the originating strategy and score it.
    pub fn record_outcome(&self, decision: &ExitDecision, result: &CloseResult, regime: MarketRegime) {
        forward_outcome(&self.strategies, &self.arena, &decision.signal, result);

        let Some(strategy) = self.strategies.iter().find(|s| s.name() == decision.strategy()) else {
            return;
        };
        let loss_cut = strategy.kind().style() == ExitStyle::LossCut;
        let beneficial = result.is_success() && (result.profit >= 0.0 || loss_cut);
        self.update_performance(decision.strategy(), beneficial, result.profit, regime);
    }

    pub fn unregister(&self, ticket: Ticket) -> bool {
        self.arena.unregister(ticket)
    }

    pub fn retain_open(&self, open: &HashSet<Ticket>) -> Vec<Ticket> {
        self.arena.retain_open(open)
    }
}

impl std::fmt::Debug for DynamicExitSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicExitSelector")
            .field("strategies", &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("min_utility", &self.config.min_utility)
            .field("tracked", &self.stats.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::exit::strategy::fixtures::{now, position};
    use crate::exit::strategy::{EvalContext, StrategyKind};
    use crate::state::StrategyScope;
    use crate::telemetry::{null_sink, RecordingSink};
    use crate::types::{AccountSnapshot, ExitSignal, IndicatorSnapshot, Side};

    struct Always {
        name: &'static str,
        kind: StrategyKind,
        priority: u8,
        confidence: f64,
    }

    impl ExitStrategy for Always {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> StrategyKind {
            self.kind
        }
        fn base_priority(&self) -> u8 {
            self.priority
        }
        fn should_exit(
            &self,
            ctx: &EvalContext<'_>,
            _scope: &mut StrategyScope<'_>,
        ) -> Result<Option<ExitSignal>, StrategyError> {
            Ok(Some(
                ExitSignal::close(ctx.position.ticket, self.name, "always", self.priority)
                    .with_confidence(self.confidence),
            ))
        }
    }

    fn always(name: &'static str, kind: StrategyKind, priority: u8, confidence: f64) -> Arc<dyn ExitStrategy> {
        Arc::new(Always {
            name,
            kind,
            priority,
            confidence,
        })
    }

    fn data() -> MarketData {
        MarketData::new(IndicatorSnapshot::new(), AccountSnapshot::default()).at(now())
    }

    fn losing_long() -> (Position, PositionContext) {
        let p = position(Side::Long, 98.5);
        let pc = PositionContext::derive(&p, &Default::default(), now());
        (p, pc)
    }

    #[test]
    fn weights_are_normalised() {
        let w = UtilityWeights {
            pnl: 2.0,
            risk: 2.0,
            time: 0.0,
            regime: 0.0,
            confidence: 0.0,
        };
        assert_eq!(w.normalized(), [0.5, 0.5, 0.0, 0.0, 0.0]);
        let bad = UtilityWeights {
            pnl: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn loss_cut_beats_profit_take_on_a_loser() {
        let mut selector = DynamicExitSelector::new(SelectorConfig::default(), null_sink()).unwrap();
        selector.register(always("take", StrategyKind::ProfitTarget, 60, 1.0)).unwrap();
        selector.register(always("cut", StrategyKind::StopLoss, 90, 1.0)).unwrap();

        let (p, pc) = losing_long();
        let market = MarketContext {
            volatility: 1.0,
            ..Default::default()
        };
        let decision = selector.select(&p, &market, &pc, &data()).unwrap();
        assert_eq!(decision.strategy(), "cut");
        assert!(decision.adjustments[0].starts_with("utility="));
    }

    #[test]
    fn threshold_gates_weak_candidates() {
        let mut selector = DynamicExitSelector::new(
            SelectorConfig {
                min_utility: 0.95,
                ..Default::default()
            },
            null_sink(),
        )
        .unwrap();
        selector.register(always("take", StrategyKind::ProfitTarget, 60, 0.2)).unwrap();
        let (p, pc) = losing_long();
        assert!(selector.select(&p, &MarketContext::default(), &pc, &data()).is_none());

        selector.register(always("survive", StrategyKind::SurvivalMode, 100, 0.2)).unwrap();
        let decision = selector.select(&p, &MarketContext::default(), &pc, &data()).unwrap();
        assert_eq!(decision.strategy(), "survive", "priority 100 bypasses the threshold");
    }

    #[test]
    fn bypass_reaches_candidates_below_the_argmax() {
        let gated = |bypass_priority| {
            let mut selector = DynamicExitSelector::new(
                SelectorConfig {
                    min_utility: 0.95,
                    bypass_priority,
                    ..Default::default()
                },
                null_sink(),
            )
            .unwrap();
            selector.register(always("take", StrategyKind::ProfitTarget, 60, 1.0)).unwrap();
            selector.register(always("survive", StrategyKind::SurvivalMode, 100, 1.0)).unwrap();
            selector
        };

        let p = position(Side::Long, 101.5);
        let pc = PositionContext::derive(&p, &Default::default(), now());
        let market = MarketContext::default();
        let regime = gated(None).regime(&market);

        let selector = gated(Some(100));
        let take = selector.utility(selector.strategies()[0].as_ref(), 1.0, &market, &pc, regime);
        let survive = selector.utility(selector.strategies()[1].as_ref(), 1.0, &market, &pc, regime);
        assert!(take.total > survive.total);
        assert!(take.total < 0.95);

        let decision = selector.select(&p, &market, &pc, &data()).unwrap();
        assert_eq!(decision.strategy(), "survive");
        assert_eq!(decision.priority, 100);

        assert!(gated(None).select(&p, &market, &pc, &data()).is_none());
    }

    #[test]
    fn history_moves_confidence() {
        let selector = DynamicExitSelector::new(SelectorConfig::default(), null_sink()).unwrap();
        let fresh = selector.performance("cut", None);
        assert_eq!(fresh.samples, 0);
        assert!((fresh.success_rate - 0.5).abs() < 1e-9);

        for _ in 0..6 {
            selector.update_performance("cut", true, 5.0, MarketRegime::Volatile);
        }
        let global = selector.performance("cut", None);
        assert!((global.success_rate - (6.0 + 2.0) / 10.0).abs() < 1e-9);

        for _ in 0..6 {
            selector.update_performance("cut", false, -5.0, MarketRegime::Ranging);
        }
        let volatile = selector.performance("cut", Some(MarketRegime::Volatile));
        let ranging = selector.performance("cut", Some(MarketRegime::Ranging));
        assert!(volatile.success_rate > ranging.success_rate);
        // too few samples in Dead → falls back to the global window
        assert_eq!(selector.performance("cut", Some(MarketRegime::Dead)).samples, 12);
    }

    #[test]
    fn window_is_bounded() {
        let selector = DynamicExitSelector::new(
            SelectorConfig {
                window: 3,
                ..Default::default()
            },
            null_sink(),
        )
        .unwrap();
        for i in 0..10 {
            selector.update_performance("x", i % 2 == 0, 1.0, MarketRegime::Trending);
        }
        assert_eq!(selector.performance("x", None).samples, 3);
    }

    #[test]
    fn decisions_reach_telemetry_and_feed_history() {
        let sink = RecordingSink::new();
        let mut selector = DynamicExitSelector::new(SelectorConfig::default(), sink.clone()).unwrap();
        selector.register(always("cut", StrategyKind::StopLoss, 90, 1.0)).unwrap();
        let (p, pc) = losing_long();
        let decision = selector.select(&p, &MarketContext::default(), &pc, &data()).unwrap();
        assert_eq!(sink.count("decision_triggered"), 1);

        selector.record_outcome(&decision, &CloseResult::filled(1.0, -1.5), MarketRegime::Dead);
        let perf = selector.performance("cut", None);
        assert_eq!(perf.samples, 1);
        assert!(perf.success_rate > 0.5, "a filled loss cut counts as beneficial");
    }
}
