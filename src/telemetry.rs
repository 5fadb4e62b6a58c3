// =============================================================================
// Telemetry — fire-and-forget audit trail of exit decisions
// =============================================================================
//
// Components receive an injected `SharedSink` instead of writing to a global
// logger. Every triggered decision and every tier transition is recorded.
// Sinks must never block the evaluation path: the channel sink drops events
// when its buffer is full.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::Ticket;

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    DecisionTriggered {
        ticket: Ticket,
        strategy: String,
        reason: String,
        priority: u8,
        base_priority: u8,
        volume: Option<f64>,
        at: DateTime<Utc>,
    },
    TierHit {
        ticket: Ticket,
        tier: usize,
        price: f64,
        at: DateTime<Utc>,
    },
    TierExecuted {
        ticket: Ticket,
        tier: usize,
        volume: f64,
        at: DateTime<Utc>,
    },
    TierRolledBack {
        ticket: Ticket,
        tier: usize,
        at: DateTime<Utc>,
    },
    StrategyFailed {
        ticket: Ticket,
        strategy: String,
        error: String,
        at: DateTime<Utc>,
    },
    RecoveryModeChanged {
        active: bool,
        drawdown_pct: f64,
        at: DateTime<Utc>,
    },
    ActionSuppressed {
        ticket: Ticket,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DecisionTriggered { .. } => "decision_triggered",
            Self::TierHit { .. } => "tier_hit",
            Self::TierExecuted { .. } => "tier_executed",
            Self::TierRolledBack { .. } => "tier_rolled_back",
            Self::StrategyFailed { .. } => "strategy_failed",
            Self::RecoveryModeChanged { .. } => "recovery_mode_changed",
            Self::ActionSuppressed { .. } => "action_suppressed",
        }
    }
}

/// Destination for telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);

    /// Flush buffered events. Called on shutdown.
    fn flush(&self) {}
}

pub type SharedSink = Arc<dyn TelemetrySink>;

/// Writes events to the tracing subscriber as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "exit_engine::telemetry", kind = event.kind(), %json, "telemetry"),
            Err(e) => debug!(error = %e, kind = event.kind(), "telemetry serialisation failed"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Forwards events to a bounded channel; drops when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn record(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "telemetry channel full or closed — event dropped");
        }
    }
}

/// Keeps every event in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

pub fn null_sink() -> SharedSink {
    Arc::new(NullSink)
}
