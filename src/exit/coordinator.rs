// =============================================================================
// Exit Coordinator — priority scheduling of registered exit strategies
// =============================================================================
//
// Per evaluation:
//   1. Compute every strategy's adjusted priority (base + context deltas).
//   2. Stable-sort strategies by adjusted priority, highest first.
//   3. Evaluate every strategy against its own per-ticket namespace.
//   4. Keep the triggered signal with the highest final priority; ties go to
//      the strategy registered first.
//
// Context deltas (additive, final value clamped to [0, 100]):
//
//   volatility > high threshold       stop-like, adverse-like   +10
//   spread > wide threshold           all                       -5
//   news event                        all                       +15
//   market close imminent             time-based                +20
//   P&L >= 80% of MFE (MFE > 0)       profit-target-like        +15
//   holding > long threshold          time-based                +10
//   P&L% < deep-loss threshold        stop-like                 +20
//
// A strategy that raises its own signal priority above its base (e.g. an
// emergency) gets the same deltas on top of the raised value.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::context::{MarketContext, PositionContext};
use crate::error::{ensure, ConfigError};
use crate::execution::CloseResult;
use crate::state::PositionArena;
use crate::telemetry::{SharedSink, TelemetryEvent};
use crate::types::{clamp_priority, ExitDecision, ExitSignal, MarketData, Position, Ticket};

// =============================================================================
// PriorityRules
// =============================================================================

fn default_high_volatility_pct() -> f64 {
    1.5
}
fn default_volatility_delta() -> i32 {
    10
}
fn default_wide_spread_bps() -> f64 {
    30.0
}
fn default_spread_delta() -> i32 {
    -5
}
fn default_news_delta() -> i32 {
    15
}
fn default_market_close_delta() -> i32 {
    20
}
fn default_profit_retention_ratio() -> f64 {
    0.8
}
fn default_profit_protect_delta() -> i32 {
    15
}
fn default_long_hold_minutes() -> f64 {
    240.0
}
fn default_long_hold_delta() -> i32 {
    10
}
fn default_deep_loss_pct() -> f64 {
    -2.0
}
fn default_deep_loss_delta() -> i32 {
    20
}

/// Thresholds and deltas for context-driven priority adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRules {
    /// ATR% above which stop-like and adverse-like strategies are boosted.
    #[serde(default = "default_high_volatility_pct")]
    pub high_volatility_pct: f64,
    #[serde(default = "default_volatility_delta")]
    pub volatility_delta: i32,
    #[serde(default = "default_wide_spread_bps")]
    pub wide_spread_bps: f64,
    #[serde(default = "default_spread_delta")]
    pub spread_delta: i32,
    #[serde(default = "default_news_delta")]
    pub news_delta: i32,
    #[serde(default = "default_market_close_delta")]
    pub market_close_delta: i32,
    /// Fraction of MFE still held at which profit-taking is boosted.
    #[serde(default = "default_profit_retention_ratio")]
    pub profit_retention_ratio: f64,
    #[serde(default = "default_profit_protect_delta")]
    pub profit_protect_delta: i32,
    #[serde(default = "default_long_hold_minutes")]
    pub long_hold_minutes: f64,
    #[serde(default = "default_long_hold_delta")]
    pub long_hold_delta: i32,
    /// P&L % below which stop-like strategies are boosted (negative).
    #[serde(default = "default_deep_loss_pct")]
    pub deep_loss_pct: f64,
    #[serde(default = "default_deep_loss_delta")]
    pub deep_loss_delta: i32,
}

impl Default for PriorityRules {
    fn default() -> Self {
        Self {
            high_volatility_pct: default_high_volatility_pct(),
            volatility_delta: default_volatility_delta(),
            wide_spread_bps: default_wide_spread_bps(),
            spread_delta: default_spread_delta(),
            news_delta: default_news_delta(),
            market_close_delta: default_market_close_delta(),
            profit_retention_ratio: default_profit_retention_ratio(),
            profit_protect_delta: default_profit_protect_delta(),
            long_hold_minutes: default_long_hold_minutes(),
            long_hold_delta: default_long_hold_delta(),
            deep_loss_pct: default_deep_loss_pct(),
            deep_loss_delta: default_deep_loss_delta(),
        }
    }
}

impl PriorityRules {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.high_volatility_pct > 0.0, "priority.high_volatility_pct", "must be positive")?;
        ensure(self.wide_spread_bps > 0.0, "priority.wide_spread_bps", "must be positive")?;
        ensure(
            self.profit_retention_ratio > 0.0 && self.profit_retention_ratio <= 1.0,
            "priority.profit_retention_ratio",
            "must be in (0, 1]",
        )?;
        ensure(self.long_hold_minutes > 0.0, "priority.long_hold_minutes", "must be positive")?;
        ensure(self.deep_loss_pct < 0.0, "priority.deep_loss_pct", "must be negative")
    }

    /// Sum of deltas that apply to `kind` in this context, with rule names.
    pub fn adjust(&self, kind: StrategyKind, market: &MarketContext, pos: &PositionContext) -> (i32, Vec<String>) {
        let mut delta = 0;
        let mut applied = Vec::new();
        let mut apply = |hit: bool, d: i32, name: &str| {
            if hit {
                delta += d;
                applied.push(format!("{name}{d:+}"));
            }
        };

        apply(
            market.volatility > self.high_volatility_pct && (kind.is_stop_like() || kind.is_adverse_like()),
            self.volatility_delta,
            "high_volatility",
        );
        apply(market.spread_bps > self.wide_spread_bps, self.spread_delta, "wide_spread");
        apply(market.news_event, self.news_delta, "news_event");
        apply(
            market.market_close_imminent && kind.is_time_based(),
            self.market_close_delta,
            "market_close",
        );
        apply(
            kind.is_profit_target_like()
                && pos.max_favorable_pct > 0.0
                && pos.pnl_pct >= self.profit_retention_ratio * pos.max_favorable_pct,
            self.profit_protect_delta,
            "profit_protection",
        );
        apply(
            kind.is_time_based() && pos.holding_minutes > self.long_hold_minutes,
            self.long_hold_delta,
            "long_hold",
        );
        apply(
            kind.is_stop_like() && pos.pnl_pct < self.deep_loss_pct,
            self.deep_loss_delta,
            "deep_loss",
        );

        (delta, applied)
    }
}

// =============================================================================
// Shared evaluation pass
// =============================================================================

/// A signal produced during one pass, with the producing strategy.
pub(crate) struct Triggered {
    pub order: usize,
    pub strategy: Arc<dyn ExitStrategy>,
    pub signal: ExitSignal,
}

/// Run `strategies` (already in evaluation order) for one position.
/// Errors are logged, reported and skipped.
pub(crate) fn run_strategies(
    strategies: &[(usize, Arc<dyn ExitStrategy>)],
    arena: &PositionArena,
    sink: &SharedSink,
    position: &Position,
    market: &MarketContext,
    position_ctx: &PositionContext,
    data: &MarketData,
) -> Vec<Triggered> {
    let ctx = EvalContext {
        position,
        market,
        position_ctx,
        indicators: &data.indicators,
        account: &data.account,
        now: data.now,
    };

    arena.with_ticket(position.ticket, |entry| {
        let mut triggered = Vec::new();
        for (order, strategy) in strategies {
            let mut scope = entry.scope(strategy.name());
            match strategy.should_exit(&ctx, &mut scope) {
                Ok(Some(mut signal)) => {
                    signal.ticket = position.ticket;
                    triggered.push(Triggered {
                        order: *order,
                        strategy: Arc::clone(strategy),
                        signal,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        ticket = position.ticket,
                        strategy = strategy.name(),
                        error = %e,
                        "Exit strategy failed — treated as no signal"
                    );
                    sink.record(TelemetryEvent::StrategyFailed {
                        ticket: position.ticket,
                        strategy: strategy.name().to_string(),
                        error: e.to_string(),
                        at: data.now,
                    });
                }
            }
        }
        triggered
    })
}

/// Tell every losing strategy that its signal was not acted on.
pub(crate) fn release_losers(arena: &PositionArena, ticket: Ticket, losers: &[Triggered]) {
    if losers.is_empty() {
        return;
    }
    arena.with_ticket(ticket, |entry| {
        for t in losers {
            let mut scope = entry.scope(t.strategy.name());
            if let Err(e) = t.strategy.on_superseded(&t.signal, &mut scope) {
                warn!(ticket, strategy = t.strategy.name(), error = %e, "on_superseded failed");
            }
        }
    });
}

/// Forward an execution result to the strategy that produced `signal`.
pub(crate) fn forward_outcome(
    strategies: &[Arc<dyn ExitStrategy>],
    arena: &PositionArena,
    signal: &ExitSignal,
    result: &CloseResult,
) {
    let Some(strategy) = strategies.iter().find(|s| s.name() == signal.strategy) else {
        debug!(strategy = %signal.strategy, "Outcome for unknown strategy ignored");
        return;
    };
    arena.with_ticket(signal.ticket, |entry| {
        let mut scope = entry.scope(strategy.name());
        if let Err(e) = strategy.on_outcome(signal, result, &mut scope) {
            warn!(ticket = signal.ticket, strategy = strategy.name(), error = %e, "on_outcome failed");
        }
    });
}

// =============================================================================
// ExitCoordinator
// =============================================================================

/// Priority scheduler over registered exit strategies.
pub struct ExitCoordinator {
    strategies: Vec<Arc<dyn ExitStrategy>>,
    rules: PriorityRules,
    arena: Arc<PositionArena>,
    sink: SharedSink,
}

impl ExitCoordinator {
    pub fn new(rules: PriorityRules, sink: SharedSink) -> Result<Self, ConfigError> {
        Self::with_arena(rules, Arc::new(PositionArena::new()), sink)
    }

    pub fn with_arena(rules: PriorityRules, arena: Arc<PositionArena>, sink: SharedSink) -> Result<Self, ConfigError> {
        rules.validate()?;
        Ok(Self {
            strategies: Vec::new(),
            rules,
            arena,
            sink,
        })
    }

    /// Append a strategy. Names double as state namespaces and must be unique.
    pub fn register(&mut self, strategy: Arc<dyn ExitStrategy>) -> Result<(), ConfigError> {
        if self.strategies.iter().any(|s| s.name() == strategy.name()) {
            return Err(ConfigError::invalid(
                "strategies",
                format!("duplicate strategy name `{}`", strategy.name()),
            ));
        }
        info!(
            strategy = strategy.name(),
            kind = %strategy.kind(),
            base_priority = strategy.base_priority(),
            "Exit strategy registered"
        );
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn strategies(&self) -> &[Arc<dyn ExitStrategy>] {
        &self.strategies
    }

    pub fn rules(&self) -> &PriorityRules {
        &self.rules
    }

    pub fn arena(&self) -> &Arc<PositionArena> {
        &self.arena
    }

    /// Update the ticket's peak tracker and derive this tick's position context.
    pub fn observe(&self, position: &Position, now: DateTime<Utc>) -> PositionContext {
        self.arena.observe(position, now)
    }

    /// Pick the single highest-priority triggered exit for `position`.
    pub fn evaluate(
        &self,
        position: &Position,
        market: &MarketContext,
        position_ctx: &PositionContext,
        data: &MarketData,
    ) -> Option<ExitDecision> {
        // (adjusted base priority, declaration order, strategy)
        let mut ordered: Vec<(i32, usize, Arc<dyn ExitStrategy>)> = self
            .strategies
            .iter()
            .enumerate()
            .map(|(order, s)| {
                let (delta, _) = self.rules.adjust(s.kind(), market, position_ctx);
                (s.base_priority() as i32 + delta, order, Arc::clone(s))
            })
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        let run_order: Vec<(usize, Arc<dyn ExitStrategy>)> =
            ordered.into_iter().map(|(_, order, s)| (order, s)).collect();
        let triggered = run_strategies(&run_order, &self.arena, &self.sink, position, market, position_ctx, data);
        if triggered.is_empty() {
            debug!(ticket = position.ticket, "No exit strategy triggered");
            return None;
        }

        let mut best: Option<(u8, usize, usize)> = None; // (priority, order, index)
        let mut scored = Vec::with_capacity(triggered.len());
        for (idx, t) in triggered.iter().enumerate() {
            let (delta, applied) = self.rules.adjust(t.strategy.kind(), market, position_ctx);
            let priority = clamp_priority(t.signal.priority as i32 + delta);
            debug!(
                ticket = position.ticket,
                strategy = t.strategy.name(),
                priority,
                reason = %t.signal.reason,
                "Exit candidate"
            );
            let better = match best {
                None => true,
                Some((p, o, _)) => priority > p || (priority == p && t.order < o),
            };
            if better {
                best = Some((priority, t.order, idx));
            }
            scored.push((priority, applied));
        }

        let (_, _, winner_idx) = best?;
        let mut triggered = triggered;
        let winner = triggered.swap_remove(winner_idx);
        let (priority, adjustments) = scored.swap_remove(winner_idx);
        release_losers(&self.arena, position.ticket, &triggered);

        let decision = ExitDecision {
            base_priority: winner.strategy.base_priority(),
            priority,
            adjustments,
            signal: winner.signal,
        };

        info!(
            ticket = position.ticket,
            strategy = decision.strategy(),
            priority = decision.priority,
            reason = %decision.signal.reason,
            volume = ?decision.signal.volume(),
            "Exit decision"
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

    /// Route an execution result back to the strategy that made the decision.
    pub fn record_outcome(&self, decision: &ExitDecision, result: &CloseResult) {
        forward_outcome(&self.strategies, &self.arena, &decision.signal, result);
    }

    pub fn unregister(&self, ticket: Ticket) -> bool {
        self.arena.unregister(ticket)
    }

    pub fn retain_open(&self, open: &HashSet<Ticket>) -> Vec<Ticket> {
        self.arena.retain_open(open)
    }
}

impl std::fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitCoordinator")
            .field("strategies", &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("rules", &self.rules)
            .field("tickets", &self.arena.len())
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
    use crate::exit::strategy::fixtures;
    use crate::state::StrategyScope;
    use crate::telemetry::RecordingSink;
    use crate::types::{AccountSnapshot, IndicatorSnapshot, Side};

    /// Fires with a fixed priority; counts evaluations in its own slot.
    struct Fixed {
        name: &'static str,
        kind: StrategyKind,
        base: u8,
        fire: bool,
        raise_to: Option<u8>,
    }

    impl ExitStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> StrategyKind {
            self.kind
        }
        fn base_priority(&self) -> u8 {
            self.base
        }
        fn should_exit(
            &self,
            ctx: &EvalContext<'_>,
            scope: &mut StrategyScope<'_>,
        ) -> Result<Option<ExitSignal>, StrategyError> {
            *scope.state::<u32>()? += 1;
            if !self.fire {
                return Ok(None);
            }
            let priority = self.raise_to.unwrap_or(self.base);
            Ok(Some(ExitSignal::close(ctx.position.ticket, self.name, self.name, priority)))
        }
    }

    struct Broken;

    impl ExitStrategy for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn kind(&self) -> StrategyKind {
            StrategyKind::ProfitTarget
        }
        fn base_priority(&self) -> u8 {
            99
        }
        fn should_exit(&self, _: &EvalContext<'_>, _: &mut StrategyScope<'_>) -> Result<Option<ExitSignal>, StrategyError> {
            Err(StrategyError::Evaluation {
                strategy: "broken".into(),
                reason: "boom".into(),
            })
        }
    }

    fn fixed(name: &'static str, kind: StrategyKind, base: u8, fire: bool) -> Arc<dyn ExitStrategy> {
        Arc::new(Fixed {
            name,
            kind,
            base,
            fire,
            raise_to: None,
        })
    }

    fn data() -> MarketData {
        MarketData::new(IndicatorSnapshot::new(), AccountSnapshot::default()).at(fixtures::now())
    }

    fn run(coord: &ExitCoordinator, position: &Position, market: &MarketContext) -> Option<ExitDecision> {
        let pctx = coord.observe(position, fixtures::now());
        coord.evaluate(position, market, &pctx, &data())
    }

    #[test]
    fn highest_priority_wins() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("low", StrategyKind::TimeBased, 30, true)).unwrap();
        c.register(fixed("high", StrategyKind::ProfitTarget, 60, true)).unwrap();
        c.register(fixed("silent", StrategyKind::StopLoss, 90, false)).unwrap();

        let d = run(&c, &fixtures::position(Side::Long, 100.5), &MarketContext::default()).unwrap();
        assert_eq!(d.strategy(), "high");
        assert_eq!(d.priority, 60 + 15, "profit protection applies at the peak");
    }

    #[test]
    fn ties_go_to_declaration_order() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("first", StrategyKind::Confluence, 50, true)).unwrap();
        c.register(fixed("second", StrategyKind::Confluence, 50, true)).unwrap();
        let d = run(&c, &fixtures::position(Side::Long, 99.9), &MarketContext::default()).unwrap();
        assert_eq!(d.strategy(), "first");
    }

    #[test]
    fn deep_loss_boosts_stop_like() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("profit", StrategyKind::ProfitTarget, 70, true)).unwrap();
        c.register(fixed("stop", StrategyKind::StopLoss, 60, true)).unwrap();
        let d = run(&c, &fixtures::position(Side::Long, 97.0), &MarketContext::default()).unwrap();
        assert_eq!(d.strategy(), "stop");
        assert_eq!(d.priority, 80);
        assert!(d.adjustments.iter().any(|a| a.starts_with("deep_loss")));
    }

    #[test]
    fn news_and_market_close_adjustments() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("time", StrategyKind::TimeBased, 40, true)).unwrap();
        c.register(fixed("confluence", StrategyKind::Confluence, 55, true)).unwrap();
        let market = MarketContext::default().with_news(true).with_market_close(true);
        let d = run(&c, &fixtures::position(Side::Long, 99.9), &market).unwrap();
        assert_eq!(d.strategy(), "time");
        assert_eq!(d.priority, 40 + 15 + 20);
    }

    #[test]
    fn raised_signal_priority_is_clamped() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(Arc::new(Fixed {
            name: "emergency",
            kind: StrategyKind::Confluence,
            base: 50,
            fire: true,
            raise_to: Some(95),
        }))
        .unwrap();
        let market = MarketContext::default().with_news(true);
        let d = run(&c, &fixtures::position(Side::Short, 100.2), &market).unwrap();
        assert_eq!(d.base_priority, 50);
        assert_eq!(d.priority, 100);
    }

    #[test]
    fn failing_strategy_is_skipped_and_reported() {
        let sink = RecordingSink::new();
        let mut c = ExitCoordinator::new(PriorityRules::default(), sink.clone()).unwrap();
        c.register(Arc::new(Broken)).unwrap();
        c.register(fixed("ok", StrategyKind::TimeBased, 10, true)).unwrap();
        let d = run(&c, &fixtures::position(Side::Long, 100.0), &MarketContext::default()).unwrap();
        assert_eq!(d.strategy(), "ok");
        assert_eq!(sink.count("strategy_failed"), 1);
        assert_eq!(sink.count("decision_triggered"), 1);
    }

    #[test]
    fn every_strategy_is_evaluated_and_state_is_dropped_on_unregister() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("a", StrategyKind::StopLoss, 10, false)).unwrap();
        c.register(fixed("b", StrategyKind::TimeBased, 20, false)).unwrap();
        let p = fixtures::position(Side::Long, 100.0);
        assert!(run(&c, &p, &MarketContext::default()).is_none());
        run(&c, &p, &MarketContext::default());
        c.arena().with_ticket(p.ticket, |e| {
            assert_eq!(e.scope("a").get::<u32>(), Some(&2));
            assert_eq!(e.scope("b").get::<u32>(), Some(&2));
        });
        assert!(c.unregister(p.ticket));
        assert!(c.arena().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut c = ExitCoordinator::new(PriorityRules::default(), crate::telemetry::null_sink()).unwrap();
        c.register(fixed("a", StrategyKind::StopLoss, 10, false)).unwrap();
        assert!(c.register(fixed("a", StrategyKind::TimeBased, 20, false)).is_err());
    }

    #[test]
    fn spread_penalty_and_volatility_boost() {
        let rules = PriorityRules::default();
        let market = MarketContext {
            volatility: 2.0,
            spread_bps: 40.0,
            ..MarketContext::default()
        };
        let pctx = PositionContext::default();
        let (d, names) = rules.adjust(StrategyKind::AdverseMovement, &market, &pctx);
        assert_eq!(d, 10 - 5);
        assert_eq!(names.len(), 2);
        let (d, _) = rules.adjust(StrategyKind::ProfitTarget, &market, &pctx);
        assert_eq!(d, -5);
    }

    #[test]
    fn profit_protection_compares_price_not_currency() {
        let rules = PriorityRules::default();
        let market = MarketContext::default();
        // Peak 2% on the full lot, now 2% on a reduced lot: all of the move is held.
        let reduced = PositionContext {
            unrealized_pnl: 1.2,
            pnl_pct: 2.0,
            max_favorable_excursion: 2.0,
            max_favorable_pct: 2.0,
            in_profit: true,
            ..PositionContext::default()
        };
        let (d, names) = rules.adjust(StrategyKind::ProfitTarget, &market, &reduced);
        assert_eq!(d, 15);
        assert_eq!(names, vec!["profit_protection+15".to_string()]);

        let retraced = PositionContext {
            pnl_pct: 1.0,
            ..reduced
        };
        assert_eq!(rules.adjust(StrategyKind::ProfitTarget, &market, &retraced).0, 0);
    }
}
