mod common;

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use exit_engine::context::MarketContext;
use exit_engine::error::TierError;
use exit_engine::exit::{
    ExitCoordinator, PriorityRules, StrategyKind, TieredRrrConfig, TieredRrrManager, TrailingStop,
    TrailingStopConfig,
};
use exit_engine::loss_curve::{AdaptiveLossCurve, LossCurveConfig};
use exit_engine::signals::{ConfluenceConfig, ConfluenceScorer, ConfluenceSignal, Indicator, SignalDirection};
use exit_engine::telemetry::null_sink;
use exit_engine::types::{keys, AccountSnapshot, ExitAction, IndicatorSnapshot, MarketData, Side};

use common::{now, position, Fixed};

const INDICATORS: [Indicator; 6] = [
    Indicator::Rsi,
    Indicator::Macd,
    Indicator::Bollinger,
    Indicator::Volume,
    Indicator::Trend,
    Indicator::Giveback,
];
const DIRECTIONS: [SignalDirection; 3] = [
    SignalDirection::ReversalUp,
    SignalDirection::ReversalDown,
    SignalDirection::Neutral,
];

fn data() -> MarketData {
    MarketData::new(
        IndicatorSnapshot::new(),
        AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            margin_level: None,
            drawdown_pct: 0.0,
        },
    )
    .at(now())
}

proptest! {
    #[test]
    fn coordinator_picks_highest_priority_then_first_registered(
        specs in prop::collection::vec((0u8..=100, any::<bool>()), 1..8)
    ) {
        let mut coordinator = ExitCoordinator::new(PriorityRules::default(), null_sink()).unwrap();
        for (i, (priority, fires)) in specs.iter().enumerate() {
            coordinator
                .register(Arc::new(Fixed::new(format!("s{i}"), StrategyKind::Confluence, *priority, *fires)))
                .unwrap();
        }

        let p = position(1, Side::Long, 100.0, 1.0, 5);
        let pc = coordinator.observe(&p, now());
        let decision = coordinator.evaluate(&p, &MarketContext::default(), &pc, &data());

        let best = specs.iter().filter(|(_, fires)| *fires).map(|(p, _)| *p).max();
        match best {
            None => prop_assert!(decision.is_none()),
            Some(max) => {
                let first = specs.iter().position(|(p, fires)| *fires && *p == max).unwrap();
                let decision = decision.unwrap();
                prop_assert_eq!(decision.priority, max);
                prop_assert_eq!(decision.strategy(), format!("s{first}"));
            }
        }
    }

    #[test]
    fn tiers_execute_once_and_conserve_volume(
        lots in 1u32..300,
        path in prop::collection::vec(99.0f64..104.5, 1..40),
        win_rate in 0.3f64..0.7,
    ) {
        let manager = TieredRrrManager::new(TieredRrrConfig::default(), null_sink()).unwrap();
        let initial = lots as f64 * 0.01;
        manager.register_position(7, Side::Long, 100.0, 98.0, initial, Some(win_rate)).unwrap();

        let mut closed = 0.0;
        let mut closes_per_tier: HashMap<usize, u32> = HashMap::new();
        for price in path {
            let actions = match manager.evaluate(7, price) {
                Ok(actions) => actions,
                Err(TierError::UnknownTicket(_)) => break,
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            };
            for action in actions {
                if let ExitAction::Close { tier: Some(tier), volume: Some(volume), .. } = action {
                    prop_assert!(volume > 0.0);
                    *closes_per_tier.entry(tier).or_default() += 1;
                    closed += volume;
                    manager.confirm_close(7, tier, volume).unwrap();
                }
            }
        }

        prop_assert!(closes_per_tier.values().all(|&n| n == 1));
        let remaining = manager.state(7).map_or(0.0, |s| s.remaining_volume);
        prop_assert!(closed + remaining <= initial + 1e-6);
        prop_assert!((closed + remaining - initial).abs() < 1e-6);
        prop_assert!(remaining == 0.0 || remaining >= 0.01 - 1e-9);
    }

    #[test]
    fn loss_limit_grows_with_balance_and_respects_cap(
        a in 100.0f64..100_000.0,
        b in 100.0f64..100_000.0,
        per_trade in any::<bool>(),
    ) {
        let curve = AdaptiveLossCurve::new(LossCurveConfig::default(), null_sink()).unwrap();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let at_lo = curve.max_loss_for(lo, per_trade, false);
        let at_hi = curve.max_loss_for(hi, per_trade, false);
        prop_assert!(at_lo <= at_hi + 1e-9);

        let scope = if per_trade { 0.5 } else { 1.0 };
        prop_assert!(at_hi <= hi * 0.06 * scope + 1e-9);
    }

    #[test]
    fn confluence_score_stays_in_unit_range(
        raw in prop::collection::vec((0usize..6, 0usize..3, -1.0f64..2.0, -1.0f64..2.0), 0..10),
        long in any::<bool>(),
    ) {
        let scorer = ConfluenceScorer::new(ConfluenceConfig::default()).unwrap();
        let side = if long { Side::Long } else { Side::Short };
        let signals: Vec<_> = raw
            .iter()
            .map(|&(i, d, s, c)| ConfluenceSignal::new(INDICATORS[i], DIRECTIONS[d], s, c))
            .collect();
        let report = scorer.score(&signals, side);
        prop_assert!((0.0..=1.0).contains(&report.score));
    }

    #[test]
    fn confluence_from_snapshot_stays_in_unit_range(
        rsi in 0.0f64..100.0,
        rsi_prev in 0.0f64..100.0,
        macd in -2.0f64..2.0,
        macd_signal in -2.0f64..2.0,
        close in 90.0f64..110.0,
        volume in 0.0f64..5_000.0,
        giveback in prop::option::of(0.0f64..1.5),
    ) {
        let scorer = ConfluenceScorer::new(ConfluenceConfig::default()).unwrap();
        let snapshot = IndicatorSnapshot::new()
            .with(keys::RSI, rsi)
            .with(keys::RSI_PREV, rsi_prev)
            .with(keys::MACD, macd)
            .with(keys::MACD_SIGNAL, macd_signal)
            .with(keys::BB_UPPER, 105.0)
            .with(keys::BB_LOWER, 95.0)
            .with(keys::CLOSE, close)
            .with(keys::VOLUME, volume)
            .with(keys::VOLUME_AVG, 1_000.0);
        for side in [Side::Long, Side::Short] {
            let report = scorer.evaluate(&snapshot, side, giveback);
            prop_assert!((0.0..=1.0).contains(&report.score));
        }
    }

    #[test]
    fn long_trailing_stop_only_ratchets_up(path in prop::collection::vec(99.0f64..106.0, 1..60)) {
        let mut coordinator = ExitCoordinator::new(PriorityRules::default(), null_sink()).unwrap();
        coordinator
            .register(Arc::new(TrailingStop::new(TrailingStopConfig::default()).unwrap()))
            .unwrap();

        let mut stop: Option<f64> = None;
        for price in path {
            let mut p = position(3, Side::Long, price, 1.0, 10);
            p.stop_loss = stop.or(p.stop_loss);
            let pc = coordinator.observe(&p, now());
            let Some(decision) = coordinator.evaluate(&p, &MarketContext::default(), &pc, &data()) else {
                continue;
            };
            if decision.signal.is_close() {
                prop_assert!(price <= stop.unwrap_or(f64::INFINITY));
                break;
            }
            for action in decision.to_actions(Side::Long) {
                if let ExitAction::ModifyStop { new_stop_loss, .. } = action {
                    prop_assert!(new_stop_loss >= 100.0);
                    prop_assert!(new_stop_loss <= price);
                    if let Some(previous) = stop {
                        prop_assert!(new_stop_loss > previous);
                    }
                    stop = Some(new_stop_loss);
                }
            }
        }
    }
}
