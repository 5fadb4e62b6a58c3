// =============================================================================
// TrailingStop — ATR-calibrated trail that only ratchets in our favour
// =============================================================================
//
// Inactive until the best favourable excursion reaches `activation_pct`.
// Once active, each tick proposes
//
//   stop = price ∓ max(ATR × atr_multiplier × mode_factor, min_distance)
//
// clamped so the stop never sits on the losing side of entry. The stop only
// moves in the protective direction. A cross of the trailed stop is a full
// close; an improvement is a low-priority stop modification.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::state::StrategyScope;
use crate::types::{keys, ExitSignal, Side};

/// Trail width preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailMode {
    Tight,
    Normal,
    Loose,
}

impl TrailMode {
    pub fn factor(self) -> f64 {
        match self {
            Self::Tight => 0.75,
            Self::Normal => 1.0,
            Self::Loose => 1.5,
        }
    }
}

impl std::fmt::Display for TrailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tight => write!(f, "TIGHT"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Loose => write!(f, "LOOSE"),
        }
    }
}

fn default_activation_pct() -> f64 {
    0.5
}
fn default_atr_multiplier() -> f64 {
    2.0
}
fn default_mode() -> TrailMode {
    TrailMode::Normal
}
fn default_min_distance_pct() -> f64 {
    0.2
}
fn default_close_priority() -> u8 {
    80
}
fn default_update_priority() -> u8 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    /// Favourable excursion (% of entry) that arms the trail.
    #[serde(default = "default_activation_pct")]
    pub activation_pct: f64,
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
    #[serde(default = "default_mode")]
    pub mode: TrailMode,
    /// Floor on the trail distance, % of price.
    #[serde(default = "default_min_distance_pct")]
    pub min_distance_pct: f64,
    #[serde(default = "default_close_priority")]
    pub close_priority: u8,
    #[serde(default = "default_update_priority")]
    pub update_priority: u8,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            activation_pct: default_activation_pct(),
            atr_multiplier: default_atr_multiplier(),
            mode: default_mode(),
            min_distance_pct: default_min_distance_pct(),
            close_priority: default_close_priority(),
            update_priority: default_update_priority(),
        }
    }
}

impl TrailingStopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.activation_pct >= 0.0, "trailing_stop.activation_pct", "must be >= 0")?;
        ensure(self.atr_multiplier > 0.0, "trailing_stop.atr_multiplier", "must be positive")?;
        ensure(self.min_distance_pct > 0.0, "trailing_stop.min_distance_pct", "must be positive")
    }

    /// Trail distance in price units.
    pub fn distance(&self, price: f64, atr: Option<f64>) -> f64 {
        let floor = price * self.min_distance_pct / 100.0;
        match atr {
            Some(atr) if atr > 0.0 => (atr * self.atr_multiplier * self.mode.factor()).max(floor),
            _ => floor,
        }
    }
}

/// Per-ticket trail watermark.
#[derive(Debug, Clone, Default)]
pub struct TrailState {
    pub stop: Option<f64>,
    pub best_price: Option<f64>,
    pub active: bool,
}

impl TrailState {
    /// Ratchet to `candidate` if it is more protective. Returns whether it moved.
    pub fn advance(&mut self, side: Side, candidate: f64) -> bool {
        match self.stop {
            Some(current) if !side.is_tighter_stop(candidate, current) => false,
            _ => {
                self.stop = Some(candidate);
                true
            }
        }
    }
}

pub struct TrailingStop {
    config: TrailingStopConfig,
}

impl TrailingStop {
    pub fn new(config: TrailingStopConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExitStrategy for TrailingStop {
    fn name(&self) -> &str {
        "trailing_stop"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::TrailingStop
    }

    fn base_priority(&self) -> u8 {
        self.config.close_priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let cfg = &self.config;
        let position = ctx.position;
        let side = position.side;
        let price = position.current_price;
        let entry = position.entry_price;
        let state = scope.state::<TrailState>()?;

        if let Some(stop) = state.stop {
            if side.stop_crossed(price, stop) {
                info!(
                    ticket = position.ticket,
                    price = format!("{:.5}", price),
                    stop = format!("{:.5}", stop),
                    "Trailing stop hit"
                );
                return Ok(Some(
                    ExitSignal::close(
                        position.ticket,
                        self.name(),
                        format!("Trailing stop hit at {:.5} ({})", stop, cfg.mode),
                        cfg.close_priority,
                    )
                    .with_exit_price(price)
                    .at(ctx.now),
                ));
            }
        }

        let best = match state.best_price {
            Some(best) if side.favorable_move(best, price) <= 0.0 => best,
            _ => price,
        };
        state.best_price = Some(best);

        if entry <= 0.0 {
            return Ok(None);
        }
        let excursion_pct = side.favorable_move(entry, best) / entry * 100.0;
        if excursion_pct < cfg.activation_pct {
            return Ok(None);
        }
        if !state.active {
            state.active = true;
            info!(
                ticket = position.ticket,
                excursion_pct = format!("{:.3}", excursion_pct),
                mode = %cfg.mode,
                "Trailing stop activated"
            );
        }

        let distance = cfg.distance(price, ctx.indicators.get(keys::ATR));
        let raw = side.offset_adverse(price, distance);
        let candidate = match side {
            Side::Long => raw.max(entry),
            Side::Short => raw.min(entry),
        };
        if side.stop_crossed(price, candidate) || !state.advance(side, candidate) {
            return Ok(None);
        }

        let broker_is_tighter = position
            .stop_loss
            .is_some_and(|sl| !side.is_tighter_stop(candidate, sl));
        if broker_is_tighter {
            debug!(ticket = position.ticket, candidate, "Trail behind broker stop — not sent");
            return Ok(None);
        }

        debug!(
            ticket = position.ticket,
            stop = format!("{:.5}", candidate),
            distance = format!("{:.5}", distance),
            "Trailing stop advanced"
        );
        Ok(Some(
            ExitSignal::modify_stop(
                position.ticket,
                self.name(),
                format!("Trail stop to {:.5}", candidate),
                cfg.update_priority,
                candidate,
            )
            .at(ctx.now),
        ))
    }
}
