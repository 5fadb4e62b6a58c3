// =============================================================================
// Paper Broker — in-memory execution engine and market feed
// =============================================================================
//
// Simulates fills at the last price, keeps open and closed positions, the
// account balance and per-symbol indicator snapshots. Used by the binary's
// demo mode and by tests.
//
// Life-cycle of a paper position:
//   open  ->  partial close(s)  ->  closed
//   open  ->  closed (engine close / broker-side stop hit)
//
// Failure injection (`fail_next_closes`, `fail_next_modifies`, close latency)
// lets tests drive the rollback and retry paths.
//
// Thread-safety: all mutable state is behind one `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CloseResult, ExecutionEngine, MarketFeed};
use crate::context::MarketContext;
use crate::types::{AccountSnapshot, IndicatorSnapshot, Position, Ticket};

/// Volume below which a position counts as fully closed.
const VOLUME_EPSILON: f64 = 1e-9;

/// A finished (fully closed) paper position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: Ticket,
    pub symbol: String,
    pub realized_pnl: f64,
    pub close_price: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    open: HashMap<Ticket, Position>,
    realized: HashMap<Ticket, f64>,
    closed: Vec<ClosedTrade>,
    balance: f64,
    peak_balance: f64,
    margin_level: Option<f64>,
    indicators: HashMap<String, IndicatorSnapshot>,
    contexts: HashMap<String, MarketContext>,
    fail_closes: u32,
    fail_modifies: u32,
    close_latency: Option<Duration>,
    close_calls: u32,
}

/// In-memory broker.
#[derive(Debug)]
pub struct PaperBroker {
    inner: RwLock<Inner>,
    /// Currency value of a one-lot, one-unit price move.
    contract_size: f64,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::with_balance(10_000.0)
    }

    pub fn with_balance(balance: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                balance,
                peak_balance: balance,
                ..Inner::default()
            }),
            contract_size: 1.0,
        }
    }

    pub fn with_contract_size(mut self, contract_size: f64) -> Self {
        self.contract_size = contract_size;
        self
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    pub fn open(&self, mut position: Position) {
        position.unrealized_pnl = self.pnl_of(&position, position.current_price, position.volume);
        info!(
            ticket = position.ticket,
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            volume = position.volume,
            "Paper position opened"
        );
        let mut inner = self.inner.write();
        inner.realized.insert(position.ticket, 0.0);
        inner.open.insert(position.ticket, position);
    }

    pub fn set_indicators(&self, symbol: &str, indicators: IndicatorSnapshot) {
        self.inner.write().indicators.insert(symbol.to_string(), indicators);
    }

    /// Override the derived market context for `symbol`.
    pub fn set_market_context(&self, symbol: &str, ctx: MarketContext) {
        self.inner.write().contexts.insert(symbol.to_string(), ctx);
    }

    pub fn set_balance(&self, balance: f64) {
        let mut inner = self.inner.write();
        inner.balance = balance;
        inner.peak_balance = inner.peak_balance.max(balance);
    }

    pub fn set_margin_level(&self, margin_level: Option<f64>) {
        self.inner.write().margin_level = margin_level;
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.inner.write().fail_closes = n;
    }

    pub fn fail_next_modifies(&self, n: u32) {
        self.inner.write().fail_modifies = n;
    }

    pub fn set_close_latency(&self, latency: Option<Duration>) {
        self.inner.write().close_latency = latency;
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Mark every open position on `symbol` to `price`, tracking peak
    /// excursions. A broker-side stop that is crossed closes the position at
    /// the stop price.
    pub fn update_price(&self, symbol: &str, price: f64) {
        let stopped: Vec<(Ticket, f64)> = {
            let mut inner = self.inner.write();
            let mut stopped = Vec::new();
            for pos in inner.open.values_mut().filter(|p| p.symbol == symbol) {
                pos.current_price = price;
                pos.unrealized_pnl = self.pnl_of(pos, price, pos.volume);
                pos.peak_favorable = pos.peak_favorable.max(pos.unrealized_pnl);
                pos.peak_adverse = pos.peak_adverse.max(-pos.unrealized_pnl);
                if let Some(stop) = pos.stop_loss {
                    if pos.side.stop_crossed(price, stop) {
                        stopped.push((pos.ticket, stop));
                    }
                }
            }
            stopped
        };

        for (ticket, stop) in stopped {
            debug!(ticket, stop, "Broker-side stop hit");
            self.fill(ticket, None, stop, "broker stop");
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn position_snapshot(&self, ticket: Ticket) -> Option<Position> {
        self.inner.read().open.get(&ticket).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.inner.read().open.len()
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.inner.read().closed.clone()
    }

    pub fn balance(&self) -> f64 {
        self.inner.read().balance
    }

    pub fn close_calls(&self) -> u32 {
        self.inner.read().close_calls
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    fn pnl_of(&self, position: &Position, price: f64, volume: f64) -> f64 {
        position.side.favorable_move(position.entry_price, price) * volume * self.contract_size
    }

    /// Close `volume` (or everything) of `ticket` at `price`.
    fn fill(&self, ticket: Ticket, volume: Option<f64>, price: f64, reason: &str) -> CloseResult {
        let mut inner = self.inner.write();
        let Some(pos) = inner.open.get_mut(&ticket) else {
            return CloseResult::rejected(format!("ticket {ticket} is not open"));
        };

        let requested = volume.unwrap_or(pos.volume);
        if requested <= 0.0 {
            return CloseResult::rejected("volume must be positive");
        }
        let filled = requested.min(pos.volume);
        let profit = self.pnl_of(pos, price, filled);
        pos.volume -= filled;
        pos.unrealized_pnl = self.pnl_of(pos, price, pos.volume);
        let remaining = pos.volume;
        let symbol = pos.symbol.clone();

        inner.balance += profit;
        inner.peak_balance = inner.peak_balance.max(inner.balance);
        let realized = {
            let r = inner.realized.entry(ticket).or_insert(0.0);
            *r += profit;
            *r
        };

        if remaining <= VOLUME_EPSILON {
            inner.open.remove(&ticket);
            inner.realized.remove(&ticket);
            inner.closed.push(ClosedTrade {
                ticket,
                symbol,
                realized_pnl: realized,
                close_price: price,
                reason: reason.to_string(),
                closed_at: Utc::now(),
            });
            info!(ticket, reason, close_price = price, realized_pnl = realized, "Paper position closed");
        } else {
            info!(ticket, filled, remaining, profit, "Paper partial close");
        }

        if filled + VOLUME_EPSILON < requested {
            CloseResult::partially_filled(filled, profit)
        } else {
            CloseResult::filled(filled, profit)
        }
    }
}

#[async_trait]
impl ExecutionEngine for PaperBroker {
    async fn close_position(&self, ticket: Ticket, volume: Option<f64>) -> CloseResult {
        let (latency, fail, price) = {
            let mut inner = self.inner.write();
            inner.close_calls += 1;
            let fail = inner.fail_closes > 0;
            if fail {
                inner.fail_closes -= 1;
            }
            let price = inner.open.get(&ticket).map(|p| p.current_price);
            (inner.close_latency, fail, price)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            warn!(ticket, "Paper close failed (injected)");
            return CloseResult::failed("injected failure");
        }
        match price {
            Some(price) => self.fill(ticket, volume, price, "engine close"),
            None => CloseResult::rejected(format!("ticket {ticket} is not open")),
        }
    }

    async fn modify_stop_loss(&self, ticket: Ticket, new_stop_loss: f64) -> bool {
        let mut inner = self.inner.write();
        if inner.fail_modifies > 0 {
            inner.fail_modifies -= 1;
            return false;
        }
        match inner.open.get_mut(&ticket) {
            Some(pos) => {
                pos.stop_loss = Some(new_stop_loss);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MarketFeed for PaperBroker {
    async fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.read().open.values().cloned().collect();
        positions.sort_by_key(|p| p.ticket);
        positions
    }

    async fn position(&self, ticket: Ticket) -> Option<Position> {
        self.position_snapshot(ticket)
    }

    async fn account(&self) -> AccountSnapshot {
        let inner = self.inner.read();
        let floating: f64 = inner.open.values().map(|p| p.unrealized_pnl).sum();
        let drawdown_pct = if inner.peak_balance > 0.0 {
            ((inner.peak_balance - inner.balance) / inner.peak_balance * 100.0).max(0.0)
        } else {
            0.0
        };
        AccountSnapshot {
            balance: inner.balance,
            equity: inner.balance + floating,
            margin_level: inner.margin_level,
            drawdown_pct,
        }
    }

    async fn indicators(&self, symbol: &str) -> IndicatorSnapshot {
        self.inner.read().indicators.get(symbol).cloned().unwrap_or_default()
    }

    async fn market_context(&self, symbol: &str, indicators: &IndicatorSnapshot) -> MarketContext {
        if let Some(ctx) = self.inner.read().contexts.get(symbol) {
            return ctx.clone();
        }
        MarketContext::from_indicators(indicators, 0.0, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn long(ticket: Ticket, volume: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".into(),
            side: Side::Long,
            entry_price: 100.0,
            current_price: 100.0,
            volume,
            unrealized_pnl: 0.0,
            stop_loss: Some(98.0),
            take_profit: None,
            opened_at: Utc::now(),
            peak_favorable: 0.0,
            peak_adverse: 0.0,
        }
    }

    #[tokio::test]
    async fn partial_then_full_close() {
        let broker = PaperBroker::with_balance(1_000.0);
        broker.open(long(1, 1.0));
        broker.update_price("EURUSD", 102.0);

        let r = broker.close_position(1, Some(0.4)).await;
        assert!(r.is_success());
        assert!((r.filled_volume - 0.4).abs() < 1e-9);
        assert!((r.profit - 0.8).abs() < 1e-9);
        assert!((broker.position_snapshot(1).unwrap().volume - 0.6).abs() < 1e-9);

        let r = broker.close_position(1, None).await;
        assert!((r.filled_volume - 0.6).abs() < 1e-9);
        assert_eq!(broker.open_count(), 0);
        assert!((broker.closed_trades()[0].realized_pnl - 2.0).abs() < 1e-9);
        assert!((broker.balance() - 1_002.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn broker_stop_closes_at_stop_price() {
        let broker = PaperBroker::new();
        broker.open(long(1, 1.0));
        broker.update_price("EURUSD", 97.5);
        assert_eq!(broker.open_count(), 0);
        assert_eq!(broker.closed_trades()[0].close_price, 98.0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let broker = PaperBroker::new();
        broker.open(long(1, 1.0));
        broker.fail_next_closes(1);
        assert!(!broker.close_position(1, None).await.is_success());
        assert!(broker.close_position(1, None).await.is_success());
        assert_eq!(broker.close_calls(), 2);
    }

    #[tokio::test]
    async fn account_reports_floating_equity() {
        let broker = PaperBroker::with_balance(500.0);
        broker.open(long(1, 2.0));
        broker.update_price("EURUSD", 101.0);
        let acct = broker.account().await;
        assert_eq!(acct.balance, 500.0);
        assert!((acct.equity - 502.0).abs() < 1e-9);
    }
}
