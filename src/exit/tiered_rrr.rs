// =============================================================================
// Tiered RRR Manager — partial closes across reward:risk targets
// =============================================================================
//
// Each registered position gets N targets at increasing reward:risk
// multiples. Spacing adapts to the system's historical win rate w:
//
//   breakeven RRR = (1 − w) / w
//   centre        = breakeven + margin
//   spacing       = base_spacing × 0.5 / w
//   rrr_i         = centre + (i − (N − 1) / 2) × spacing
//
// so low-win-rate systems get wider, further targets. For w = 0.5 the
// defaults give 1.3 / 1.5 / 1.7.
//
// Tier life-cycle (per ticket, per tier):
//
//   idle ──price reached──> hit+pending ──confirm_close──> executed
//                              │
//                              └──fail_close──> hit (re-emitted next tick)
//
// A pending or executed tier never emits a second close. A hit tier is
// retried even if price has since pulled back. State is destroyed once the
// remaining volume reaches zero or on unregister.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ensure, ConfigError, TierError};
use crate::telemetry::{SharedSink, TelemetryEvent};
use crate::types::{round_lots, ExitAction, LotSpec, Side, Ticket};

/// Tolerance when comparing prices against targets.
const PRICE_EPSILON: f64 = 1e-9;

/// Volume below which a position counts as fully closed.
const VOLUME_EPSILON: f64 = 1e-9;

/// Strategy name used on emitted actions.
pub const TIERED_RRR_NAME: &str = "tiered_rrr";

// =============================================================================
// Config
// =============================================================================

fn default_enabled() -> bool {
    true
}
fn default_num_targets() -> usize {
    3
}
fn default_close_fractions() -> Vec<f64> {
    vec![0.4, 0.3, 0.3]
}
fn default_breakeven_margin() -> f64 {
    0.5
}
fn default_base_spacing() -> f64 {
    0.2
}
fn default_min_rrr() -> f64 {
    0.5
}
fn default_breakeven_buffer_pct() -> f64 {
    0.05
}
fn default_breakeven_tier() -> Option<usize> {
    Some(0)
}
fn default_trailing_tier() -> Option<usize> {
    Some(1)
}
fn default_trail_risk_fraction() -> f64 {
    0.5
}
fn default_win_rate() -> f64 {
    0.5
}
fn default_priority() -> u8 {
    70
}
fn default_stop_priority() -> u8 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredRrrConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_num_targets")]
    pub num_targets: usize,
    /// Fraction of the initial volume closed at each tier; sums to 1.
    #[serde(default = "default_close_fractions")]
    pub close_fractions: Vec<f64>,
    #[serde(default = "default_breakeven_margin")]
    pub breakeven_margin: f64,
    #[serde(default = "default_base_spacing")]
    pub base_spacing: f64,
    #[serde(default = "default_min_rrr")]
    pub min_rrr: f64,
    /// Buffer beyond entry for the breakeven stop, percent of entry.
    #[serde(default = "default_breakeven_buffer_pct")]
    pub breakeven_buffer_pct: f64,
    /// Tier whose hit moves the stop to breakeven.
    #[serde(default = "default_breakeven_tier")]
    pub breakeven_tier: Option<usize>,
    /// Tier whose hit enables the trailing stop.
    #[serde(default = "default_trailing_tier")]
    pub trailing_tier: Option<usize>,
    /// Trailing distance as a fraction of the initial risk.
    #[serde(default = "default_trail_risk_fraction")]
    pub trail_risk_fraction: f64,
    /// Win rate used when none is supplied at registration.
    #[serde(default = "default_win_rate")]
    pub default_win_rate: f64,
    #[serde(default)]
    pub lots: LotSpec,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Priority of stop-only updates (breakeven / trailing without a close).
    #[serde(default = "default_stop_priority")]
    pub stop_priority: u8,
}

impl Default for TieredRrrConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            num_targets: default_num_targets(),
            close_fractions: default_close_fractions(),
            breakeven_margin: default_breakeven_margin(),
            base_spacing: default_base_spacing(),
            min_rrr: default_min_rrr(),
            breakeven_buffer_pct: default_breakeven_buffer_pct(),
            breakeven_tier: default_breakeven_tier(),
            trailing_tier: default_trailing_tier(),
            trail_risk_fraction: default_trail_risk_fraction(),
            default_win_rate: default_win_rate(),
            lots: LotSpec::default(),
            priority: default_priority(),
            stop_priority: default_stop_priority(),
        }
    }
}

impl TieredRrrConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.num_targets >= 1, "tiered_rrr.num_targets", "must be at least 1")?;
        ensure(
            self.close_fractions.len() == self.num_targets,
            "tiered_rrr.close_fractions",
            "need one fraction per target",
        )?;
        let sum: f64 = self.close_fractions.iter().sum();
        if self.close_fractions.iter().any(|f| *f <= 0.0) || (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Weights {
                component: "tiered_rrr.close_fractions".into(),
            });
        }
        ensure(self.base_spacing > 0.0, "tiered_rrr.base_spacing", "must be positive")?;
        ensure(self.min_rrr > 0.0, "tiered_rrr.min_rrr", "must be positive")?;
        ensure(self.breakeven_buffer_pct >= 0.0, "tiered_rrr.breakeven_buffer_pct", "must be >= 0")?;
        ensure(
            self.trail_risk_fraction > 0.0,
            "tiered_rrr.trail_risk_fraction",
            "must be positive",
        )?;
        ensure(
            self.default_win_rate > 0.0 && self.default_win_rate < 1.0,
            "tiered_rrr.default_win_rate",
            "must be in (0, 1)",
        )?;
        for (field, tier) in [("breakeven_tier", self.breakeven_tier), ("trailing_tier", self.trailing_tier)] {
            if let Some(t) = tier {
                ensure(t < self.num_targets, &format!("tiered_rrr.{field}"), "out of range")?;
            }
        }
        self.lots.validate("tiered_rrr.lots")
    }

    /// Reward:risk multiples for a system with win rate `win_rate`.
    pub fn rrr_levels(&self, win_rate: f64) -> Vec<f64> {
        let w = win_rate.clamp(0.2, 0.8);
        let breakeven = (1.0 - w) / w;
        let centre = breakeven + self.breakeven_margin;
        let spacing = self.base_spacing * 0.5 / w;
        let mid = (self.num_targets as f64 - 1.0) / 2.0;

        (0..self.num_targets)
            .map(|i| {
                let rrr = centre + (i as f64 - mid) * spacing;
                rrr.max(self.min_rrr + 0.1 * i as f64)
            })
            .collect()
    }
}

// =============================================================================
// State
// =============================================================================

/// One profit target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrrTarget {
    pub index: usize,
    pub rrr: f64,
    pub price: f64,
    /// Fraction of the initial volume.
    pub close_pct: f64,
    pub move_to_breakeven: bool,
    pub trail_after: bool,
}

/// Per-ticket tier progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionExitState {
    pub ticket: Ticket,
    pub side: Side,
    pub entry_price: f64,
    pub initial_stop: f64,
    pub initial_volume: f64,
    pub remaining_volume: f64,
    pub targets: Vec<RrrTarget>,
    pub hit: BTreeSet<usize>,
    pub executed: BTreeSet<usize>,
    /// Tiers with a close in flight, and the volume requested.
    pub pending: BTreeMap<usize, f64>,
    pub breakeven_moved: bool,
    pub trailing_active: bool,
    pub current_stop: f64,
    /// Last stop this manager sent that the broker has not reported back yet.
    #[serde(default)]
    pub unconfirmed_stop: Option<f64>,
}

impl PositionExitState {
    pub fn risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    fn pending_volume(&self) -> f64 {
        self.pending.values().sum()
    }

    fn breakeven_price(&self, buffer_pct: f64) -> f64 {
        self.side.offset_favorable(self.entry_price, self.entry_price * buffer_pct / 100.0)
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Tier state machine for every registered ticket.
pub struct TieredRrrManager {
    config: TieredRrrConfig,
    states: RwLock<HashMap<Ticket, PositionExitState>>,
    sink: SharedSink,
}

impl TieredRrrManager {
    pub fn new(config: TieredRrrConfig, sink: SharedSink) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            states: RwLock::new(HashMap::new()),
            sink,
        })
    }

    pub fn config(&self) -> &TieredRrrConfig {
        &self.config
    }

    /// Create tier state for a ticket. Re-registering an existing ticket
    /// returns its targets unchanged.
    pub fn register_position(
        &self,
        ticket: Ticket,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        volume: f64,
        win_rate: Option<f64>,
    ) -> Result<Vec<RrrTarget>, TierError> {
        if let Some(existing) = self.states.read().get(&ticket) {
            return Ok(existing.targets.clone());
        }

        let risk = side.favorable_move(stop_loss, entry_price);
        if !(risk > 0.0) || !entry_price.is_finite() {
            return Err(TierError::Registration {
                ticket,
                reason: format!("stop {stop_loss} is not on the losing side of entry {entry_price}"),
            });
        }
        if !(volume > 0.0) {
            return Err(TierError::Registration {
                ticket,
                reason: "volume must be positive".into(),
            });
        }

        let w = win_rate.unwrap_or(self.config.default_win_rate);
        let targets: Vec<RrrTarget> = self
            .config
            .rrr_levels(w)
            .into_iter()
            .enumerate()
            .map(|(index, rrr)| RrrTarget {
                index,
                rrr,
                price: side.offset_favorable(entry_price, risk * rrr),
                close_pct: self.config.close_fractions[index],
                move_to_breakeven: self.config.breakeven_tier == Some(index),
                trail_after: self.config.trailing_tier == Some(index),
            })
            .collect();

        info!(
            ticket,
            side = %side,
            entry = entry_price,
            stop = stop_loss,
            win_rate = format!("{:.2}", w),
            targets = ?targets.iter().map(|t| format!("{:.2}@{:.5}", t.rrr, t.price)).collect::<Vec<_>>(),
            "Tiered RRR targets registered"
        );

        let state = PositionExitState {
            ticket,
            side,
            entry_price,
            initial_stop: stop_loss,
            initial_volume: volume,
            remaining_volume: volume,
            targets: targets.clone(),
            hit: BTreeSet::new(),
            executed: BTreeSet::new(),
            pending: BTreeMap::new(),
            breakeven_moved: false,
            trailing_active: false,
            current_stop: stop_loss,
            unconfirmed_stop: None,
        };
        self.states.write().entry(ticket).or_insert(state);
        Ok(targets)
    }

    pub fn is_registered(&self, ticket: Ticket) -> bool {
        self.states.read().contains_key(&ticket)
    }

    pub fn state(&self, ticket: Ticket) -> Option<PositionExitState> {
        self.states.read().get(&ticket).cloned()
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.states.read().keys().copied().collect()
    }

    /// Adopt the broker's live stop as the reference for further moves.
    ///
    /// While a stop sent from here is still unconfirmed, a looser broker stop
    /// is the stale one and is ignored.
    pub fn sync_stop(&self, ticket: Ticket, stop: Option<f64>) {
        let mut states = self.states.write();
        let (Some(stop), Some(state)) = (stop, states.get_mut(&ticket)) else {
            return;
        };
        if let Some(sent) = state.unconfirmed_stop {
            if state.side.is_tighter_stop(sent, stop) {
                return;
            }
            state.unconfirmed_stop = None;
        }
        state.current_stop = stop;
    }

    /// Settle a stop modification. A rejected stop is forgotten so the next
    /// broker sync restores the live level and the move can be retried.
    pub fn confirm_stop(&self, ticket: Ticket, stop: f64, accepted: bool) {
        let mut states = self.states.write();
        let Some(state) = states.get_mut(&ticket) else {
            return;
        };
        if state.unconfirmed_stop.is_some_and(|sent| (sent - stop).abs() <= PRICE_EPSILON) {
            state.unconfirmed_stop = None;
            if accepted {
                state.current_stop = stop;
            } else {
                debug!(ticket, stop, "Tier stop rejected, awaiting broker sync");
            }
        }
    }

    /// Shrink the remaining volume to what the broker reports (e.g. after a
    /// manual or foreign partial close).
    pub fn sync_volume(&self, ticket: Ticket, broker_volume: f64) {
        if let Some(state) = self.states.write().get_mut(&ticket) {
            let floor = broker_volume + state.pending_volume();
            if floor + VOLUME_EPSILON < state.remaining_volume {
                debug!(ticket, from = state.remaining_volume, to = floor, "Tier remaining volume synced");
                state.remaining_volume = floor;
            }
        }
    }

    /// Emit the actions due at `price`.
    pub fn evaluate(&self, ticket: Ticket, price: f64) -> Result<Vec<ExitAction>, TierError> {
        let cfg = &self.config;
        let mut actions = Vec::new();
        let mut hits = Vec::new();

        {
            let mut states = self.states.write();
            let state = states.get_mut(&ticket).ok_or(TierError::UnknownTicket(ticket))?;
            let side = state.side;
            let last = state.targets.len().saturating_sub(1);

            for idx in 0..state.targets.len() {
                if state.executed.contains(&idx) || state.pending.contains_key(&idx) {
                    continue;
                }
                let target = &state.targets[idx];
                let reached = side.favorable_move(target.price, price) >= -PRICE_EPSILON;
                if !reached && !state.hit.contains(&idx) {
                    continue;
                }
                if state.hit.insert(idx) {
                    hits.push(idx);
                }

                let available = state.remaining_volume - state.pending_volume();
                if available <= VOLUME_EPSILON {
                    break;
                }
                let desired = state.initial_volume * target.close_pct;
                let volume = round_lots(cfg.lots.close_volume(desired, available, idx == last));
                state.pending.insert(idx, volume);

                actions.push(ExitAction::Close {
                    ticket,
                    volume: Some(volume),
                    reason: format!("TP{} hit (RRR {:.2} @ {:.5})", idx + 1, target.rrr, target.price),
                    priority: cfg.priority,
                    strategy: TIERED_RRR_NAME.to_string(),
                    tier: Some(idx),
                });

                if target.trail_after {
                    state.trailing_active = true;
                }
            }

            // Breakeven: once the breakeven tier is hit, until the stop sits there.
            if let Some(be_tier) = cfg.breakeven_tier {
                let be = state.breakeven_price(cfg.breakeven_buffer_pct);
                if state.hit.contains(&be_tier)
                    && side.is_tighter_stop(be, state.current_stop)
                    && !side.stop_crossed(price, be)
                {
                    state.current_stop = be;
                    state.unconfirmed_stop = Some(be);
                    state.breakeven_moved = true;
                    actions.push(ExitAction::ModifyStop {
                        ticket,
                        side,
                        new_stop_loss: be,
                        reason: "Move stop to breakeven".into(),
                        priority: cfg.priority,
                        strategy: TIERED_RRR_NAME.to_string(),
                    });
                }
            }

            if state.trailing_active {
                let candidate = side.offset_adverse(price, state.risk() * cfg.trail_risk_fraction);
                if side.is_tighter_stop(candidate, state.current_stop) && !side.stop_crossed(price, candidate) {
                    state.current_stop = candidate;
                    state.unconfirmed_stop = Some(candidate);
                    actions.push(ExitAction::ModifyStop {
                        ticket,
                        side,
                        new_stop_loss: candidate,
                        reason: "Tier trailing stop".into(),
                        priority: cfg.stop_priority,
                        strategy: TIERED_RRR_NAME.to_string(),
                    });
                }
            }
        }

        let now = Utc::now();
        for tier in hits {
            info!(ticket, tier, price, "Tier target hit");
            self.sink.record(TelemetryEvent::TierHit { ticket, tier, price, at: now });
        }
        Ok(actions)
    }

    /// Mark an in-flight tier executed. Confirming an executed tier again is a no-op.
    pub fn confirm_close(&self, ticket: Ticket, tier: usize, filled: f64) -> Result<(), TierError> {
        let finished = {
            let mut states = self.states.write();
            let state = states.get_mut(&ticket).ok_or(TierError::UnknownTicket(ticket))?;
            if tier >= state.targets.len() {
                return Err(TierError::UnknownTier { ticket, tier });
            }
            if state.executed.contains(&tier) {
                return Ok(());
            }
            if state.pending.remove(&tier).is_none() {
                return Err(TierError::NotPending { ticket, tier });
            }
            state.executed.insert(tier);
            state.remaining_volume = round_lots((state.remaining_volume - filled.max(0.0)).max(0.0));
            let done = state.remaining_volume <= VOLUME_EPSILON;
            if done {
                states.remove(&ticket);
            }
            done
        };

        info!(ticket, tier, filled, "Tier close confirmed");
        self.sink.record(TelemetryEvent::TierExecuted {
            ticket,
            tier,
            volume: filled,
            at: Utc::now(),
        });
        if finished {
            debug!(ticket, "All tier volume closed — state dropped");
        }
        Ok(())
    }

    /// Roll an in-flight tier back to hit-but-not-executed.
    pub fn fail_close(&self, ticket: Ticket, tier: usize) -> Result<(), TierError> {
        {
            let mut states = self.states.write();
            let state = states.get_mut(&ticket).ok_or(TierError::UnknownTicket(ticket))?;
            if tier >= state.targets.len() {
                return Err(TierError::UnknownTier { ticket, tier });
            }
            if state.pending.remove(&tier).is_none() {
                return Err(TierError::NotPending { ticket, tier });
            }
        }
        warn!(ticket, tier, "Tier close failed — rolled back to hit");
        self.sink.record(TelemetryEvent::TierRolledBack {
            ticket,
            tier,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn unregister(&self, ticket: Ticket) -> bool {
        self.states.write().remove(&ticket).is_some()
    }

    /// Drop state for tickets that are no longer open.
    pub fn retain_open(&self, open: &HashSet<Ticket>) -> usize {
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|ticket, _| open.contains(ticket));
        before - states.len()
    }
}

impl std::fmt::Debug for TieredRrrManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredRrrManager")
            .field("config", &self.config)
            .field("tickets", &self.states.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{null_sink, RecordingSink};

    fn manager() -> TieredRrrManager {
        TieredRrrManager::new(TieredRrrConfig::default(), null_sink()).unwrap()
    }

    fn closes(actions: &[ExitAction]) -> Vec<(usize, f64)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ExitAction::Close { tier: Some(t), volume: Some(v), .. } => Some((*t, *v)),
                _ => None,
            })
            .collect()
    }

    fn stops(actions: &[ExitAction]) -> Vec<f64> {
        actions
            .iter()
            .filter_map(|a| match a {
                ExitAction::ModifyStop { new_stop_loss, .. } => Some(*new_stop_loss),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn targets_for_even_win_rate() {
        let m = manager();
        let targets = m.register_position(1, Side::Long, 100.0, 98.0, 1.0, Some(0.5)).unwrap();
        let rrr: Vec<f64> = targets.iter().map(|t| t.rrr).collect();
        let prices: Vec<f64> = targets.iter().map(|t| t.price).collect();
        for (got, want) in rrr.iter().zip([1.3, 1.5, 1.7]) {
            assert!((got - want).abs() < 1e-9, "rrr {got} vs {want}");
        }
        for (got, want) in prices.iter().zip([102.6, 103.0, 103.4]) {
            assert!((got - want).abs() < 1e-9, "price {got} vs {want}");
        }
    }

    #[test]
    fn low_win_rate_targets_are_wider() {
        let cfg = TieredRrrConfig::default();
        let low = cfg.rrr_levels(0.3);
        let high = cfg.rrr_levels(0.7);
        assert!(low[0] > high[0]);
        assert!(low[2] - low[0] > high[2] - high[0]);
        assert!(high.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn price_path_triggers_two_partials_and_breakeven() {
        let m = manager();
        m.register_position(1, Side::Long, 100.0, 98.0, 1.0, Some(0.5)).unwrap();

        assert!(m.evaluate(1, 101.0).unwrap().is_empty());

        let a = m.evaluate(1, 102.6).unwrap();
        assert_eq!(closes(&a), vec![(0, 0.4)]);
        let be = stops(&a);
        assert_eq!(be.len(), 1);
        assert!((be[0] - 100.05).abs() < 1e-9);

        // Re-evaluating while tier 0 is in flight emits nothing.
        assert!(closes(&m.evaluate(1, 102.7).unwrap()).is_empty());
        m.confirm_close(1, 0, 0.4).unwrap();

        let a = m.evaluate(1, 103.0).unwrap();
        assert_eq!(closes(&a), vec![(1, 0.3)]);
        // trailing enabled by tier 1: 103 - 2 * 0.5 = 102
        assert_eq!(stops(&a), vec![102.0]);
        m.confirm_close(1, 1, 0.3).unwrap();

        let s = m.state(1).unwrap();
        assert_eq!(s.executed.len(), 2);
        assert!((s.remaining_volume - 0.3).abs() < 1e-9);
        assert!(s.breakeven_moved);
    }

    #[test]
    fn failed_close_rolls_back_and_is_retried() {
        let sink = RecordingSink::new();
        let m = TieredRrrManager::new(TieredRrrConfig::default(), sink.clone()).unwrap();
        m.register_position(1, Side::Short, 100.0, 102.0, 1.0, None).unwrap();

        assert_eq!(closes(&m.evaluate(1, 97.4).unwrap()), vec![(0, 0.4)]);
        m.fail_close(1, 0).unwrap();
        assert!(m.state(1).unwrap().hit.contains(&0));

        // Price pulled back above target; the hit tier is still retried.
        assert_eq!(closes(&m.evaluate(1, 97.8).unwrap()), vec![(0, 0.4)]);
        m.confirm_close(1, 0, 0.4).unwrap();
        m.confirm_close(1, 0, 0.4).unwrap();
        assert!((m.state(1).unwrap().remaining_volume - 0.6).abs() < 1e-9);

        assert_eq!(sink.count("tier_hit"), 1);
        assert_eq!(sink.count("tier_rolled_back"), 1);
        assert_eq!(sink.count("tier_executed"), 1);
    }

    #[test]
    fn stale_broker_stop_does_not_resend_breakeven() {
        let m = manager();
        m.register_position(1, Side::Long, 100.0, 98.0, 1.0, Some(0.5)).unwrap();
        let sent = stops(&m.evaluate(1, 102.6).unwrap());
        assert_eq!(sent.len(), 1);
        assert!((sent[0] - 100.05).abs() < 1e-9);

        // modification still in flight, broker reports the old level
        m.sync_stop(1, Some(98.0));
        assert_eq!(m.state(1).unwrap().current_stop, sent[0]);
        assert!(stops(&m.evaluate(1, 102.6).unwrap()).is_empty());

        m.sync_stop(1, Some(sent[0]));
        assert_eq!(m.state(1).unwrap().unconfirmed_stop, None);

        // a rejected move is resent once the broker level is restored
        m.register_position(2, Side::Long, 100.0, 98.0, 1.0, Some(0.5)).unwrap();
        let sent = stops(&m.evaluate(2, 102.6).unwrap());
        m.confirm_stop(2, sent[0], false);
        m.sync_stop(2, Some(98.0));
        assert_eq!(m.state(2).unwrap().current_stop, 98.0);
        assert_eq!(stops(&m.evaluate(2, 102.6).unwrap()), sent);
    }

    #[test]
    fn gap_through_all_targets_closes_everything() {
        let m = manager();
        m.register_position(1, Side::Long, 100.0, 98.0, 1.0, None).unwrap();
        let a = m.evaluate(1, 110.0).unwrap();
        let c = closes(&a);
        assert_eq!(c.len(), 3);
        let total: f64 = c.iter().map(|(_, v)| v).sum();
        assert!((total - 1.0).abs() < 1e-9);
        for (tier, v) in c {
            m.confirm_close(1, tier, v).unwrap();
        }
        assert!(!m.is_registered(1), "state dropped once nothing remains");
    }

    #[test]
    fn small_position_never_leaves_sub_minimum_remainder() {
        let m = manager();
        m.register_position(1, Side::Long, 100.0, 98.0, 0.02, None).unwrap();
        let a = m.evaluate(1, 102.6).unwrap();
        // 0.4 × 0.02 = 0.008 → min lot 0.01, leaving 0.01: allowed
        assert_eq!(closes(&a), vec![(0, 0.01)]);
        m.confirm_close(1, 0, 0.01).unwrap();
        let a = m.evaluate(1, 103.0).unwrap();
        // 0.3 × 0.02 = 0.006 → would need 0.01 of the 0.01 left: close it all
        assert_eq!(closes(&a), vec![(1, 0.01)]);
    }

    #[test]
    fn errors_for_unknown_or_idle_tiers() {
        let m = manager();
        assert_eq!(m.evaluate(9, 1.0).unwrap_err(), TierError::UnknownTicket(9));
        m.register_position(1, Side::Long, 100.0, 98.0, 1.0, None).unwrap();
        assert_eq!(m.confirm_close(1, 7, 0.1).unwrap_err(), TierError::UnknownTier { ticket: 1, tier: 7 });
        assert_eq!(m.fail_close(1, 0).unwrap_err(), TierError::NotPending { ticket: 1, tier: 0 });
        assert!(m.register_position(2, Side::Long, 100.0, 101.0, 1.0, None).is_err());
    }

    #[test]
    fn retain_open_drops_closed_tickets() {
        let m = manager();
        m.register_position(1, Side::Long, 100.0, 98.0, 1.0, None).unwrap();
        m.register_position(2, Side::Long, 100.0, 98.0, 1.0, None).unwrap();
        let open: HashSet<Ticket> = [2].into_iter().collect();
        assert_eq!(m.retain_open(&open), 1);
        assert!(m.is_registered(2));
        assert!(m.unregister(2));
    }
}
