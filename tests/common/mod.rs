#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};

use exit_engine::error::StrategyError;
use exit_engine::exit::{EvalContext, ExitStrategy, StrategyKind};
use exit_engine::state::StrategyScope;
use exit_engine::types::{ExitSignal, Position, Side, Ticket};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

/// Position with entry 100 and the stop 2 away, opened `minutes` ago.
pub fn position(ticket: Ticket, side: Side, price: f64, volume: f64, minutes: i64) -> Position {
    let pnl = side.favorable_move(100.0, price) * volume;
    Position {
        ticket,
        symbol: "EURUSD".into(),
        side,
        entry_price: 100.0,
        current_price: price,
        volume,
        unrealized_pnl: pnl,
        stop_loss: Some(side.offset_adverse(100.0, 2.0)),
        take_profit: None,
        opened_at: now() - Duration::minutes(minutes),
        peak_favorable: pnl.max(0.0),
        peak_adverse: (-pnl).max(0.0),
    }
}

/// Strategy that fires a full close at a fixed priority when armed.
pub struct Fixed {
    pub name: String,
    pub kind: StrategyKind,
    pub priority: u8,
    pub fires: bool,
}

impl Fixed {
    pub fn new(name: impl Into<String>, kind: StrategyKind, priority: u8, fires: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            fires,
        }
    }
}

impl ExitStrategy for Fixed {
    fn name(&self) -> &str {
        &self.name
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
        Ok(self
            .fires
            .then(|| ExitSignal::close(ctx.position.ticket, &self.name, "fixed", self.priority)))
    }
}
