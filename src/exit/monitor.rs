// =============================================================================
// Exit Monitor Loop — periodic evaluation of every open position
// =============================================================================
//
// Runs as a background Tokio task, waking every `interval_ms` to:
//   1. Apply execution outcomes that arrived since the last tick.
//   2. Feed the account balance to the loss curve (recovery mode).
//   3. Drop per-ticket state for positions that are no longer open.
//   4. Register new tickets with the tier manager.
//   5. Ask the decision engine for one decision per position and hand the
//      resulting actions to the dispatcher.
//
// Only one close per ticket can be in flight. Tickets with a close in flight
// are skipped; a close the dispatcher still refuses is reported back to the
// deciding strategy as rejected so reserved tier state is rolled back.
//
//   let (shutdown_tx, shutdown_rx) = watch::channel(false);
//   tokio::spawn(monitor.run(shutdown_rx));
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::tiered_rrr::TieredRrrManager;
use super::DecisionEngine;
use crate::error::{ensure, ConfigError};
use crate::execution::{ActionOutcome, CloseResult, DispatchConfig, Dispatcher, ExecutionEngine, MarketFeed};
use crate::loss_curve::AdaptiveLossCurve;
use crate::regime::MarketRegime;
use crate::telemetry::{SharedSink, TelemetryEvent};
use crate::types::{ExitAction, ExitDecision, IndicatorSnapshot, MarketData, Position, Ticket};

fn default_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick period of the monitor loop.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.interval_ms > 0, "monitor.interval_ms", "must be positive")
    }
}

/// Decision awaiting its close outcome.
struct PendingDecision {
    decision: ExitDecision,
    regime: Option<MarketRegime>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub evaluated: usize,
    pub decisions: usize,
    pub suppressed: usize,
    pub outcomes: usize,
    pub cleaned: usize,
}

pub struct ExitMonitor {
    engine: DecisionEngine,
    tiers: Option<Arc<TieredRrrManager>>,
    loss_curve: Arc<AdaptiveLossCurve>,
    feed: Arc<dyn MarketFeed>,
    dispatcher: Dispatcher,
    outcomes: mpsc::UnboundedReceiver<ActionOutcome>,
    pending: HashMap<Ticket, PendingDecision>,
    sink: SharedSink,
    interval: Duration,
}

impl ExitMonitor {
    /// Spawns the dispatch worker; must be called inside a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: DecisionEngine,
        tiers: Option<Arc<TieredRrrManager>>,
        loss_curve: Arc<AdaptiveLossCurve>,
        execution: Arc<dyn ExecutionEngine>,
        feed: Arc<dyn MarketFeed>,
        dispatch: &DispatchConfig,
        config: &MonitorConfig,
        sink: SharedSink,
    ) -> Self {
        let (dispatcher, outcomes) = Dispatcher::spawn(execution, Arc::clone(&feed), dispatch);
        Self {
            engine,
            tiers,
            loss_curve,
            feed,
            dispatcher,
            outcomes,
            pending: HashMap::new(),
            sink,
            interval: Duration::from_millis(config.interval_ms),
        }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn tiers(&self) -> Option<&Arc<TieredRrrManager>> {
        self.tiers.as_ref()
    }

    pub fn loss_curve(&self) -> &Arc<AdaptiveLossCurve> {
        &self.loss_curve
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run one full evaluation pass.
    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary {
            outcomes: self.drain_outcomes(),
            ..Default::default()
        };

        let now = Utc::now();
        let account = self.feed.account().await;
        if account.balance > 0.0 {
            self.loss_curve.observe(account.balance);
        }

        let positions = self.feed.open_positions().await;
        let open: HashSet<Ticket> = positions.iter().map(|p| p.ticket).collect();
        summary.cleaned = self.cleanup(&open);

        if positions.is_empty() {
            debug!("Exit monitor: no open positions");
            return summary;
        }

        let mut indicators: HashMap<String, IndicatorSnapshot> = HashMap::new();
        for position in &positions {
            if position.current_price <= 0.0 || position.volume <= 0.0 {
                warn!(
                    ticket = position.ticket,
                    symbol = %position.symbol,
                    price = position.current_price,
                    volume = position.volume,
                    "Invalid position snapshot — skipping exit evaluation"
                );
                continue;
            }
            if self.dispatcher.in_flight().contains(position.ticket) {
                debug!(ticket = position.ticket, "Close in flight — skipping evaluation");
                continue;
            }
            self.ensure_tiers(position);

            if !indicators.contains_key(&position.symbol) {
                let snapshot = self.feed.indicators(&position.symbol).await;
                indicators.insert(position.symbol.clone(), snapshot);
            }
            let snapshot = indicators.get(&position.symbol).cloned().unwrap_or_default();
            let market = self.feed.market_context(&position.symbol, &snapshot).await;
            let data = MarketData::new(snapshot, account.clone()).at(now);

            let position_ctx = self.engine.observe(position, now);
            summary.evaluated += 1;

            let Some((decision, regime)) = self.engine.decide(position, &market, &position_ctx, &data) else {
                continue;
            };
            summary.decisions += 1;
            if !self.dispatch(position, decision, regime).await {
                summary.suppressed += 1;
            }
        }

        debug!(
            evaluated = summary.evaluated,
            decisions = summary.decisions,
            suppressed = summary.suppressed,
            "Exit monitor tick complete"
        );
        summary
    }

    /// Loop until `shutdown` flips to true, then flush the dispatch queue.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            mode = %self.engine.mode(),
            "Exit monitor started"
        );
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop accepting actions, wait for queued ones and apply their outcomes.
    pub async fn shutdown(&mut self) {
        self.dispatcher.shutdown().await;
        let applied = self.drain_outcomes();
        info!(applied, pending = self.pending.len(), "Exit monitor stopped");
    }

    fn ensure_tiers(&self, position: &Position) {
        let Some(tiers) = &self.tiers else {
            return;
        };
        if tiers.is_registered(position.ticket) {
            return;
        }
        let Some(stop) = position.stop_loss else {
            debug!(ticket = position.ticket, "No stop loss — tiers not registered");
            return;
        };
        if let Err(e) = tiers.register_position(
            position.ticket,
            position.side,
            position.entry_price,
            stop,
            position.volume,
            None,
        ) {
            debug!(ticket = position.ticket, error = %e, "Tier registration skipped");
        }
    }

    /// Submit the decision's actions. Returns false when the close was refused.
    async fn dispatch(&mut self, position: &Position, decision: ExitDecision, regime: Option<MarketRegime>) -> bool {
        let actions = decision.to_actions(position.side);
        let closes = actions.first().is_some_and(|a| a.is_close());

        for action in actions {
            let is_close = action.is_close();
            if let Err(e) = self.dispatcher.submit(action).await {
                warn!(ticket = position.ticket, strategy = decision.strategy(), error = %e, "Exit action suppressed");
                self.sink.record(TelemetryEvent::ActionSuppressed {
                    ticket: position.ticket,
                    reason: e.to_string(),
                    at: Utc::now(),
                });
                if is_close {
                    self.engine
                        .record_outcome(&decision, &CloseResult::rejected(e.to_string()), regime);
                    return false;
                }
            }
        }

        if closes {
            self.pending.insert(position.ticket, PendingDecision { decision, regime });
        }
        true
    }

    fn drain_outcomes(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(outcome) = self.outcomes.try_recv() {
            self.apply_outcome(outcome);
            applied += 1;
        }
        applied
    }

    fn apply_outcome(&mut self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Closed { action, result, guard } => {
                let ticket = action.ticket();
                match self.pending.remove(&ticket) {
                    Some(p) => {
                        if result.is_success() {
                            info!(
                                ticket,
                                strategy = p.decision.strategy(),
                                status = %result.status,
                                volume = result.filled_volume,
                                profit = format!("{:.2}", result.profit),
                                "Exit executed"
                            );
                        } else {
                            warn!(
                                ticket,
                                strategy = p.decision.strategy(),
                                status = %result.status,
                                error = ?result.error,
                                "Exit failed — state rolled back"
                            );
                        }
                        self.engine.record_outcome(&p.decision, &result, p.regime);
                    }
                    None => error!(ticket, status = %result.status, "Close outcome without a pending decision"),
                }
                // release the ticket only after state has been updated
                drop(guard);
            }
            ActionOutcome::StopModified { action, accepted } => {
                if let (ExitAction::ModifyStop { ticket, new_stop_loss, .. }, Some(tiers)) = (&action, &self.tiers) {
                    tiers.confirm_stop(*ticket, *new_stop_loss, accepted);
                }
                if accepted {
                    debug!(ticket = action.ticket(), "Stop modification accepted");
                } else {
                    warn!(ticket = action.ticket(), "Stop modification abandoned");
                }
            }
        }
    }

    fn cleanup(&mut self, open: &HashSet<Ticket>) -> usize {
        let removed = self.engine.retain_open(open);
        let tiers_removed = self.tiers.as_ref().map_or(0, |t| t.retain_open(open));
        let in_flight = self.dispatcher.in_flight();
        self.pending
            .retain(|ticket, _| open.contains(ticket) || in_flight.contains(*ticket));
        if !removed.is_empty() || tiers_removed > 0 {
            info!(tickets = ?removed, tiers_removed, "Cleaned up state for closed positions");
        }
        removed.len()
    }
}

impl std::fmt::Debug for ExitMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitMonitor")
            .field("engine", &self.engine)
            .field("pending", &self.pending.len())
            .field("interval", &self.interval)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::exit::build_engine;
    use crate::execution::PaperBroker;
    use crate::telemetry::RecordingSink;
    use crate::types::Side;

    fn long(ticket: Ticket, price: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".into(),
            side: Side::Long,
            entry_price: 100.0,
            current_price: price,
            volume: 1.0,
            unrealized_pnl: 0.0,
            stop_loss: Some(98.0),
            take_profit: None,
            opened_at: Utc::now(),
            peak_favorable: 0.0,
            peak_adverse: 0.0,
        }
    }

    fn monitor(config: &EngineConfig, broker: Arc<PaperBroker>, sink: SharedSink) -> ExitMonitor {
        let parts = build_engine(config, Arc::clone(&sink)).unwrap();
        ExitMonitor::new(
            parts.engine,
            parts.tiers,
            parts.loss_curve,
            broker.clone(),
            broker,
            &config.dispatch,
            &config.monitor,
            sink,
        )
    }

    /// Tiers only: a full profit target would close the rest at the same price.
    fn tiers_only() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.strategies.profit_target = None;
        config
    }

    async fn settle(m: &mut ExitMonitor) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.drain_outcomes();
    }

    #[tokio::test]
    async fn first_tier_is_taken_once() {
        let broker = Arc::new(PaperBroker::with_balance(10_000.0));
        broker.open(long(1, 100.0));
        let sink = RecordingSink::new();
        let mut m = monitor(&tiers_only(), broker.clone(), sink.clone());

        m.tick().await;
        assert!(m.tiers().unwrap().is_registered(1));

        let first_target = m.tiers().unwrap().state(1).unwrap().targets[0].price;
        broker.update_price("EURUSD", first_target + 0.01);
        let summary = m.tick().await;
        assert_eq!(summary.decisions, 1);
        settle(&mut m).await;

        let state = m.tiers().unwrap().state(1).unwrap();
        assert!(state.executed.contains(&0));
        assert!((broker.position_snapshot(1).unwrap().volume - 0.6).abs() < 1e-9);

        // same price again: nothing new to take
        let calls = broker.close_calls();
        m.tick().await;
        settle(&mut m).await;
        assert_eq!(broker.close_calls(), calls);
        assert_eq!(sink.count("tier_executed"), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn failed_close_rolls_tier_back_and_retries() {
        let broker = Arc::new(PaperBroker::with_balance(10_000.0));
        broker.open(long(1, 100.0));
        let mut m = monitor(&tiers_only(), broker.clone(), RecordingSink::new());
        m.tick().await;

        let first_target = m.tiers().unwrap().state(1).unwrap().targets[0].price;
        broker.fail_next_closes(1);
        broker.update_price("EURUSD", first_target + 0.01);
        m.tick().await;
        settle(&mut m).await;
        let state = m.tiers().unwrap().state(1).unwrap();
        assert!(!state.executed.contains(&0));
        assert!(state.pending.is_empty());

        m.tick().await;
        settle(&mut m).await;
        assert!(m.tiers().unwrap().state(1).unwrap().executed.contains(&0));
        m.shutdown().await;
    }

    #[tokio::test]
    async fn closed_positions_are_cleaned_up() {
        let broker = Arc::new(PaperBroker::with_balance(10_000.0));
        broker.open(long(7, 100.0));
        let mut m = monitor(&EngineConfig::default(), broker.clone(), RecordingSink::new());
        m.tick().await;
        assert!(m.tiers().unwrap().is_registered(7));

        // stop hit at the broker
        broker.update_price("EURUSD", 97.0);
        settle(&mut m).await;
        let summary = m.tick().await;
        assert_eq!(broker.open_count(), 0);
        assert!(!m.tiers().unwrap().is_registered(7));
        assert_eq!(summary.evaluated, 0);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let broker = Arc::new(PaperBroker::with_balance(10_000.0));
        let config = EngineConfig {
            monitor: MonitorConfig { interval_ms: 5 },
            ..Default::default()
        };
        let m = monitor(&config, broker, RecordingSink::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(m.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
