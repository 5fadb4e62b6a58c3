// =============================================================================
// TieredRrrExit — the tier manager plugged into the strategy pipeline
// =============================================================================
//
// The manager may emit several closes plus stop moves on one tick (a gap
// through two targets). The pipeline carries one signal per strategy, so the
// closes are merged into a single partial close whose metadata lists the
// tiers and their volumes, and the tightest stop rides along as the
// stop-after-close. Outcomes are split back per tier.
// =============================================================================

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::strategy::{EvalContext, ExitStrategy, StrategyKind};
use super::tiered_rrr::{TieredRrrManager, TIERED_RRR_NAME};
use crate::error::{StrategyError, TierError};
use crate::execution::CloseResult;
use crate::state::StrategyScope;
use crate::types::{ExitAction, ExitIntent, ExitSignal, Side};

const META_TIERS: &str = "tiers";
const META_TIER_VOLUMES: &str = "tier_volumes";

pub struct TieredRrrExit {
    manager: Arc<TieredRrrManager>,
}

impl TieredRrrExit {
    pub fn new(manager: Arc<TieredRrrManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<TieredRrrManager> {
        &self.manager
    }
}

/// `(tier, requested volume)` pairs carried in a merged signal.
fn tiers_of(signal: &ExitSignal) -> Vec<(usize, f64)> {
    let tiers = signal.metadata.get(META_TIERS).and_then(Value::as_array);
    let volumes = signal.metadata.get(META_TIER_VOLUMES).and_then(Value::as_array);
    match (tiers, volumes) {
        (Some(tiers), Some(volumes)) => tiers
            .iter()
            .zip(volumes)
            .filter_map(|(t, v)| Some((t.as_u64()? as usize, v.as_f64()?)))
            .collect(),
        _ => signal.tier.map(|t| vec![(t, signal.volume().unwrap_or(0.0))]).unwrap_or_default(),
    }
}

fn tightest(side: Side, stops: &[(f64, String)]) -> Option<&(f64, String)> {
    stops.iter().fold(None, |best, candidate| match best {
        Some(b) if !side.is_tighter_stop(candidate.0, b.0) => Some(b),
        _ => Some(candidate),
    })
}

/// Stop level a signal would send to the broker.
fn stop_of(signal: &ExitSignal) -> Option<f64> {
    match signal.intent {
        ExitIntent::ModifyStop { new_stop_loss } => Some(new_stop_loss),
        ExitIntent::Close { .. } => signal.stop_after_close,
    }
}

impl ExitStrategy for TieredRrrExit {
    fn name(&self) -> &str {
        TIERED_RRR_NAME
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::TieredRrr
    }

    fn base_priority(&self) -> u8 {
        self.manager.config().priority
    }

    fn should_exit(
        &self,
        ctx: &EvalContext<'_>,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<Option<ExitSignal>, StrategyError> {
        let position = ctx.position;
        if !self.manager.is_registered(position.ticket) {
            return Ok(None);
        }
        self.manager.sync_stop(position.ticket, position.stop_loss);
        self.manager.sync_volume(position.ticket, position.volume);

        let actions = self.manager.evaluate(position.ticket, position.current_price)?;
        if actions.is_empty() {
            return Ok(None);
        }

        let mut closes: Vec<(usize, f64, String)> = Vec::new();
        let mut stops: Vec<(f64, String)> = Vec::new();
        for action in actions {
            match action {
                ExitAction::Close {
                    tier: Some(tier),
                    volume: Some(volume),
                    reason,
                    ..
                } => closes.push((tier, volume, reason)),
                ExitAction::ModifyStop { new_stop_loss, reason, .. } => stops.push((new_stop_loss, reason)),
                other => debug!(ticket = position.ticket, action = ?other, "Unexpected tier action ignored"),
            }
        }

        let cfg = self.manager.config();
        let stop = tightest(position.side, &stops);

        if closes.is_empty() {
            return Ok(stop.map(|(sl, reason)| {
                ExitSignal::modify_stop(position.ticket, TIERED_RRR_NAME, reason.clone(), cfg.stop_priority, *sl)
                    .at(ctx.now)
            }));
        }

        let total: f64 = closes.iter().map(|(_, v, _)| v).sum();
        let reason = closes.iter().map(|(_, _, r)| r.as_str()).collect::<Vec<_>>().join("; ");
        let mut signal = ExitSignal::partial(position.ticket, TIERED_RRR_NAME, reason, cfg.priority, total)
            .with_tier(closes[0].0)
            .with_exit_price(position.current_price)
            .with_meta(META_TIERS, json!(closes.iter().map(|(t, _, _)| t).collect::<Vec<_>>()))
            .with_meta(META_TIER_VOLUMES, json!(closes.iter().map(|(_, v, _)| v).collect::<Vec<_>>()))
            .at(ctx.now);
        if let Some((sl, _)) = stop {
            signal = signal.with_stop_after_close(*sl);
        }
        Ok(Some(signal))
    }

    fn on_outcome(
        &self,
        signal: &ExitSignal,
        result: &CloseResult,
        _scope: &mut StrategyScope<'_>,
    ) -> Result<(), StrategyError> {
        let tiers = tiers_of(signal);
        if result.is_success() {
            let requested: f64 = tiers.iter().map(|(_, v)| v).sum();
            let ratio = if requested > 0.0 {
                (result.filled_volume / requested).min(1.0)
            } else {
                1.0
            };
            for (tier, volume) in tiers {
                match self.manager.confirm_close(signal.ticket, tier, volume * ratio) {
                    Ok(()) | Err(TierError::UnknownTicket(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            warn!(
                ticket = signal.ticket,
                status = %result.status,
                error = ?result.error,
                "Tier close not filled — rolling back"
            );
            if let Some(stop) = stop_of(signal) {
                self.manager.confirm_stop(signal.ticket, stop, false);
            }
            for (tier, _) in tiers {
                match self.manager.fail_close(signal.ticket, tier) {
                    Ok(()) | Err(TierError::UnknownTicket(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn on_superseded(&self, signal: &ExitSignal, _scope: &mut StrategyScope<'_>) -> Result<(), StrategyError> {
        if let Some(stop) = stop_of(signal) {
            self.manager.confirm_stop(signal.ticket, stop, false);
        }
        if !signal.is_close() {
            return Ok(());
        }
        for (tier, _) in tiers_of(signal) {
            match self.manager.fail_close(signal.ticket, tier) {
                Ok(()) | Err(TierError::UnknownTicket(_)) | Err(TierError::NotPending { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::fixtures::{position, Harness};
    use crate::exit::tiered_rrr::TieredRrrConfig;
    use crate::telemetry::null_sink;

    fn setup() -> (TieredRrrExit, Harness) {
        let manager = Arc::new(TieredRrrManager::new(TieredRrrConfig::default(), null_sink()).unwrap());
        manager.register_position(1, Side::Long, 100.0, 98.0, 1.0, Some(0.5)).unwrap();
        (TieredRrrExit::new(manager), Harness::new(position(Side::Long, 100.0)))
    }

    #[test]
    fn unregistered_ticket_is_silent() {
        let manager = Arc::new(TieredRrrManager::new(TieredRrrConfig::default(), null_sink()).unwrap());
        let strategy = TieredRrrExit::new(manager);
        let mut h = Harness::new(position(Side::Long, 110.0));
        assert!(h.run(&strategy).is_none());
    }

    #[test]
    fn first_target_yields_partial_with_breakeven_stop() {
        let (strategy, mut h) = setup();
        h.set_price(102.6);
        let signal = h.run(&strategy).unwrap();
        assert_eq!(signal.volume(), Some(0.4));
        assert_eq!(signal.tier, Some(0));
        assert!((signal.stop_after_close.unwrap() - 100.05).abs() < 1e-9);

        h.feedback(&strategy, &signal, &CloseResult::filled(0.4, 2.6));
        let state = strategy.manager().state(1).unwrap();
        assert!(state.executed.contains(&0));
        assert!((state.remaining_volume - 0.6).abs() < 1e-9);
    }

    #[test]
    fn gap_merges_tiers_and_splits_partial_fill() {
        let (strategy, mut h) = setup();
        h.set_price(103.1);
        let signal = h.run(&strategy).unwrap();
        assert!((signal.volume().unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(tiers_of(&signal), vec![(0, 0.4), (1, 0.3)]);

        h.feedback(&strategy, &signal, &CloseResult::partially_filled(0.35, 1.0));
        let state = strategy.manager().state(1).unwrap();
        assert_eq!(state.executed.len(), 2);
        assert!((state.remaining_volume - 0.65).abs() < 1e-9);
    }

    #[test]
    fn rejection_and_supersession_release_the_tier() {
        let (strategy, mut h) = setup();
        h.set_price(102.6);
        let signal = h.run(&strategy).unwrap();
        h.feedback(&strategy, &signal, &CloseResult::rejected("off quotes"));
        assert!(strategy.manager().state(1).unwrap().pending.is_empty());

        let again = h.run(&strategy).unwrap();
        assert_eq!(again.tier, Some(0));
        h.supersede(&strategy, &again);
        let state = strategy.manager().state(1).unwrap();
        assert!(state.pending.is_empty());
        assert!(state.hit.contains(&0));
    }

    #[test]
    fn unsent_breakeven_is_offered_again() {
        let (strategy, mut h) = setup();
        h.set_price(102.6);
        let signal = h.run(&strategy).unwrap();
        assert!(signal.stop_after_close.is_some());

        // broker still at 98 while the breakeven is outstanding
        assert!(h.run(&strategy).is_none());

        h.supersede(&strategy, &signal);
        let retried = h.run(&strategy).unwrap();
        assert_eq!(retried.tier, Some(0));
        assert!((retried.stop_after_close.unwrap() - 100.05).abs() < 1e-9);
    }
}
