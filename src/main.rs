// =============================================================================
// Exit Engine — paper-trading entry point
// =============================================================================
//
// Wires the configured decision engine to the in-memory paper broker, opens
// a demo position and drives its price with a slow random walk until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exit_engine::config::EngineConfig;
use exit_engine::execution::PaperBroker;
use exit_engine::exit::{build_engine, ExitMonitor};
use exit_engine::telemetry::tracing_sink;
use exit_engine::types::{keys, IndicatorSnapshot, Position, Side};

const DEFAULT_CONFIG_PATH: &str = "exit_engine.json";
const DEMO_SYMBOL: &str = "EURUSD";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // ── 2. Engine ────────────────────────────────────────────────────────
    let sink = tracing_sink();
    let parts = build_engine(&config, Arc::clone(&sink))?;

    let broker = Arc::new(PaperBroker::with_balance(1_000.0));
    broker.open(Position {
        ticket: 1,
        symbol: DEMO_SYMBOL.into(),
        side: Side::Long,
        entry_price: 100.0,
        current_price: 100.0,
        volume: 1.0,
        unrealized_pnl: 0.0,
        stop_loss: Some(98.0),
        take_profit: None,
        opened_at: Utc::now(),
        peak_favorable: 0.0,
        peak_adverse: 0.0,
    });

    let monitor = ExitMonitor::new(
        parts.engine,
        parts.tiers,
        parts.loss_curve,
        broker.clone(),
        broker.clone(),
        &config.dispatch,
        &config.monitor,
        sink,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    // ── 3. Demo price feed ───────────────────────────────────────────────
    let feed = broker.clone();
    let interval_ms = config.monitor.interval_ms;
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut price = 100.0_f64;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let drift: f64 = rng.gen_range(-0.45..0.55);
            price = (price + drift * 0.2).max(1.0);
            feed.set_indicators(
                DEMO_SYMBOL,
                IndicatorSnapshot::new()
                    .with(keys::CLOSE, price)
                    .with(keys::ATR, 0.4),
            );
            feed.update_price(DEMO_SYMBOL, price);
            if feed.open_count() == 0 {
                info!(balance = format!("{:.2}", feed.balance()), "Demo position fully closed");
                break;
            }
        }
    });

    info!(mode = %config.selection, "Exit engine running. Press Ctrl+C to stop.");

    // ── 4. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor_task.await {
        error!(error = %e, "Exit monitor task failed");
    }

    for trade in broker.closed_trades() {
        info!(
            ticket = trade.ticket,
            reason = %trade.reason,
            pnl = format!("{:.2}", trade.realized_pnl),
            "Closed trade"
        );
    }
    info!("Exit engine shut down complete.");
    Ok(())
}
