// =============================================================================
// Stop-loss modification with retry and revalidation
// =============================================================================
//
// Every attempt (including the first) re-reads the position from the feed
// and re-checks that the requested stop still makes sense:
//   - the ticket is still open
//   - the new stop is strictly more protective than the live one
//   - price has not already traded through the new stop
// A stop is never moved against the protective direction.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ExecutionEngine, MarketFeed};
use crate::error::{ensure, ConfigError};
use crate::types::{Position, Side, Ticket};

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Exponential backoff schedule for stop modifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.max_attempts >= 1, "retry.max_attempts", "must be at least 1")?;
        ensure(self.multiplier >= 1.0, "retry.multiplier", "must be >= 1.0")?;
        ensure(
            self.initial_backoff_ms <= self.max_backoff_ms,
            "retry.initial_backoff_ms",
            "must not exceed max_backoff_ms",
        )
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Why a stop request was dropped without reaching the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRejection {
    PositionGone,
    NotAnImprovement,
    PriceThrough,
}

impl std::fmt::Display for StopRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionGone => write!(f, "position no longer open"),
            Self::NotAnImprovement => write!(f, "stop is not more protective than the live one"),
            Self::PriceThrough => write!(f, "price already through the new stop"),
        }
    }
}

/// Check a requested stop against the latest snapshot.
pub fn revalidate(position: Option<&Position>, side: Side, new_stop_loss: f64) -> Result<(), StopRejection> {
    let position = position.ok_or(StopRejection::PositionGone)?;
    if let Some(current) = position.stop_loss {
        if !side.is_tighter_stop(new_stop_loss, current) {
            return Err(StopRejection::NotAnImprovement);
        }
    }
    if side.stop_crossed(position.current_price, new_stop_loss) {
        return Err(StopRejection::PriceThrough);
    }
    Ok(())
}

/// Move the stop for `ticket`, retrying with backoff. Returns `true` once the
/// broker accepts, `false` when revalidation drops the request or attempts run out.
pub async fn modify_stop_with_retry(
    engine: &dyn ExecutionEngine,
    feed: &dyn MarketFeed,
    ticket: Ticket,
    side: Side,
    new_stop_loss: f64,
    policy: &RetryPolicy,
) -> bool {
    for attempt in 1..=policy.max_attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }

        let snapshot = feed.position(ticket).await;
        if let Err(rejection) = revalidate(snapshot.as_ref(), side, new_stop_loss) {
            debug!(
                ticket,
                new_sl = format!("{:.5}", new_stop_loss),
                reason = %rejection,
                "Stop modification dropped on revalidation"
            );
            return false;
        }

        if engine.modify_stop_loss(ticket, new_stop_loss).await {
            info!(
                ticket,
                new_sl = format!("{:.5}", new_stop_loss),
                attempt,
                "Stop loss modified"
            );
            return true;
        }

        warn!(ticket, attempt, max_attempts = policy.max_attempts, "Stop modification rejected, retrying");
    }

    warn!(ticket, new_sl = format!("{:.5}", new_stop_loss), "Stop modification gave up");
    false
}
