// =============================================================================
// ConfluenceExit — acts on the reversal confluence class
// =============================================================================
//
//   SCALE_OUT  → partial close, 30–50% of the remaining volume by score,
//                at most `max_scale_outs` per ticket
//   CLOSE_NOW  → full close
//   EMERGENCY  → full close at elevated priority
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use crate::error::{ensure, ConfigError, StrategyError};
use crate::execution::CloseResult;
use crate::regime::remap;
use crate::signals::{ConfluenceConfig, ConfluenceReport, ConfluenceScorer, ExitClass};
use crate::state::StrategyScope;
use crate::types::{round_lots, ExitSignal, LotSpec, Side};

fn default_min_scale_fraction() -> f64 {
    0.3
}
fn default_max_scale_fraction() -> f64 {
    0.5
}
fn default_max_scale_outs() -> u32 {
    2
}
fn default_scale_out_priority() -> u8 {
    60
}
fn default_close_now_priority() -> u8 {
    75
}
fn default_emergency_priority() -> u8 {
    95
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceExitConfig {
    #[serde(default)]
    pub scoring: ConfluenceConfig,
    #[serde(default = "default_min_scale_fraction")]
    pub min_scale_fraction: f64,
    #[serde(default = "default_max_scale_fraction")]
    pub max_scale_fraction: f64,
    #[serde(default = "default_max_scale_outs")]
    pub max_scale_outs: u32,
    #[serde(default = "default_scale_out_priority")]
    pub scale_out_priority: u8,
    #[serde(default = "default_close_now_priority")]
    pub close_now_priority: u8,
    #[serde(default = "default_emergency_priority")]
    pub emergency_priority: u8,
    #[serde(default)]
    pub lots: LotSpec,
}

impl Default for ConfluenceExitConfig {
    fn default() -> Self {
        Self {
            scoring: ConfluenceConfig::default(),
            min_scale_fraction: default_min_scale_fraction(),
            max_scale_fraction: default_max_scale_fraction(),
            max_scale_outs: default_max_scale_outs(),
            scale_out_priority: default_scale_out_priority(),
            close_now_priority: default_close_now_priority(),
            emergency_priority: default_emergency_priority(),
            lots: LotSpec::default(),
        }
    }
}

impl ConfluenceExitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;
        ensure(
            self.min_scale_fraction > 0.0
                && self.min_scale_fraction <= self.max_scale_fraction
                && self.max_scale_fraction < 1.0,
            "confluence.scale_fraction",
            "need 0 < min <= max < 1",
        )?;
        self.lots.validate("confluence.lots")
    }
}

/// Scale-outs already taken for a ticket.
#[derive(Debug, Clone, Default)]
pub struct ScaleOutCount(pub u32);

pub struct ConfluenceExit {
    config: ConfluenceExitConfig,
    scorer: ConfluenceScorer,
}

impl ConfluenceExit {
    pub fn new(config: ConfluenceExitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let scorer = ConfluenceScorer::new(config.scoring.clone())?;
        Ok(Self { config, scorer })
    }

    pub fn scorer(&self) -> &ConfluenceScorer {
        &self.scorer
    }

    /// Fraction of the remaining volume to close for a SCALE_OUT `score`.
    pub fn scale_fraction(&self, score: f64) -> f64 {
        let s = &self.config.scoring;
        remap(
            score,
            s.scale_out_threshold,
            s.close_now_threshold,
            self.config.min_scale_fraction,
            self.config.max_scale_fraction,
        )
    }

    fn tag(signal: ExitSignal, report: &ConfluenceReport, side: Side) -> ExitSignal {
        signal
            .with_confidence(report.score)
            .with_meta("score", report.score)
            .with_meta("class", report.class.to_string())
            .with_meta("agreeing", report.agreeing_names(side))
    }
}

impl ExitStrategy for ConfluenceExit {
    fn name(&self) -> &str {
        "confluence"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Confluence
    }

    fn base_priority(&self) -> u8 {
        self.config.close_now_priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let cfg = &self.config;
        let position = ctx.position;
        let side = position.side;
        let report = self
            .scorer
            .evaluate(ctx.indicators, side, ctx.position_ctx.giveback_fraction());

        let signal = match report.class {
            ExitClass::Hold => return Ok(None),
            ExitClass::ScaleOut => {
                let taken = scope.state::<ScaleOutCount>()?.0;
                if taken >= cfg.max_scale_outs {
                    debug!(ticket = position.ticket, taken, "Scale-out budget exhausted");
                    return Ok(None);
                }
                let fraction = self.scale_fraction(report.score);
                let volume = round_lots(cfg.lots.close_volume(position.volume * fraction, position.volume, false));
                let reason = format!(
                    "Confluence SCALE_OUT {:.2} ({}) — closing {:.0}%",
                    report.score,
                    report.agreeing_names(side),
                    fraction * 100.0
                );
                if volume >= position.volume {
                    ExitSignal::close(position.ticket, self.name(), reason, cfg.scale_out_priority)
                } else {
                    ExitSignal::partial(position.ticket, self.name(), reason, cfg.scale_out_priority, volume)
                }
            }
            ExitClass::CloseNow => ExitSignal::close(
                position.ticket,
                self.name(),
                format!("Confluence CLOSE_NOW {:.2} ({})", report.score, report.agreeing_names(side)),
                cfg.close_now_priority,
            ),
            ExitClass::Emergency => ExitSignal::close(
                position.ticket,
                self.name(),
                format!("Confluence EMERGENCY {:.2} ({})", report.score, report.agreeing_names(side)),
                cfg.emergency_priority,
            ),
        };

        info!(
            ticket = position.ticket,
            class = %report.class,
            score = format!("{:.3}", report.score),
            agreeing = report.agreeing,
            "Confluence exit signal"
        );
        Ok(Some(Self::tag(signal, &report, side).at(ctx.now)))
    }

    fn on_outcome(
        &self,
        signal: &ExitSignal,
        result: &CloseResult,
        scope: &mut StrategyScope<'_>,
    ) -> Result<(), StrategyError> {
        if signal.volume().is_some() && result.is_success() {
            scope.state::<ScaleOutCount>()?.0 += 1;
        }
        Ok(())
    }
}
