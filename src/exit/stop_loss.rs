// =============================================================================
// StopLoss — hard protective level
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::state::StrategyScope;
use crate::types::{ExitSignal, Position};

/// Where the stop level comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StopLevel {
    /// Fixed price for every position.
    Price { price: f64 },
    /// Percent away from entry on the losing side.
    Percent { pct: f64 },
    /// The position's own stop-loss, if it has one.
    Position,
}

impl Default for StopLevel {
    fn default() -> Self {
        Self::Position
    }
}

impl StopLevel {
    pub fn resolve(&self, position: &Position) -> Option<f64> {
        match *self {
            Self::Price { price } => Some(price),
            Self::Percent { pct } => Some(
                position
                    .side
                    .offset_adverse(position.entry_price, position.entry_price * pct / 100.0),
            ),
            Self::Position => position.stop_loss,
        }
    }
}

fn default_priority() -> u8 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default)]
    pub level: StopLevel,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            level: StopLevel::default(),
            priority: default_priority(),
        }
    }
}

impl StopLossConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level {
            StopLevel::Price { price } => ensure(price > 0.0, "stop_loss.level.price", "must be positive"),
            StopLevel::Percent { pct } => ensure(pct > 0.0 && pct < 100.0, "stop_loss.level.pct", "must be in (0, 100)"),
            StopLevel::Position => Ok(()),
        }
    }
}

pub struct StopLoss {
    config: StopLossConfig,
}

impl StopLoss {
    pub fn new(config: StopLossConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for StopLoss {
    fn name(&self) -> &str {
        "stop_loss"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::StopLoss
    }

    fn base_priority(&self) -> u8 {
        self.config.priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let position = ctx.position;
        let Some(stop) = self.config.level.resolve(position) else {
            return Ok(None);
        };
        if !position.side.stop_crossed(position.current_price, stop) {
            return Ok(None);
        }

        info!(
            ticket = position.ticket,
            side = %position.side,
            price = format!("{:.5}", position.current_price),
            stop = format!("{:.5}", stop),
            "Stop loss hit"
        );
        Ok(Some(
            ExitSignal::close(
                position.ticket,
                self.name(),
                format!("Stop loss hit at {:.5}", stop),
                self.config.priority,
            )
            .with_exit_price(position.current_price)
            .at(ctx.now),
        ))
    }
}
