// =============================================================================
// Dispatcher — bounded queue + single worker in front of the execution engine
// =============================================================================
//
// Producers (the monitor) submit ExitActions. Close actions first take an
// in-flight guard for their ticket; a duplicate close for a ticket that is
// already in flight is suppressed, never queued.
//
// Enqueue waits at most `enqueue_timeout_ms`. When the queue stays full the
// action runs inline on the caller's task, still bounded by the close
// timeout, so a stuck worker cannot stall exits.
//
// Every processed action yields an ActionOutcome on the outcome channel. The
// in-flight guard travels with the outcome and is released once the consumer
// has applied it to tier/scaling state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::in_flight::{InFlightGuard, InFlightRegistry};
use super::retry::{modify_stop_with_retry, RetryPolicy};
use super::{CloseResult, ExecutionEngine, MarketFeed};
use crate::error::{ensure, ConfigError, ExecutionError};
use crate::types::{ExitAction, Ticket};

fn default_queue_capacity() -> usize {
    64
}

fn default_enqueue_timeout_ms() -> u64 {
    100
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

/// Queue and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.queue_capacity > 0, "dispatch.queue_capacity", "must be positive")?;
        ensure(self.close_timeout_ms > 0, "dispatch.close_timeout_ms", "must be positive")?;
        self.retry.validate()
    }
}

/// Result of one processed action.
#[derive(Debug)]
pub enum ActionOutcome {
    Closed {
        action: ExitAction,
        result: CloseResult,
        guard: Option<InFlightGuard>,
    },
    StopModified {
        action: ExitAction,
        accepted: bool,
    },
}

impl ActionOutcome {
    pub fn ticket(&self) -> Ticket {
        match self {
            Self::Closed { action, .. } | Self::StopModified { action, .. } => action.ticket(),
        }
    }
}

struct Job {
    action: ExitAction,
    guard: Option<InFlightGuard>,
}

/// Shared pieces the worker and the inline fallback both need.
#[derive(Clone)]
struct Executor {
    engine: Arc<dyn ExecutionEngine>,
    feed: Arc<dyn MarketFeed>,
    close_timeout: Duration,
    retry: RetryPolicy,
    outcomes: mpsc::UnboundedSender<ActionOutcome>,
}

impl Executor {
    async fn run(&self, job: Job) {
        let outcome = match job.action {
            ExitAction::Close { ticket, volume, .. } => {
                let millis = self.close_timeout.as_millis() as u64;
                let result =
                    match tokio::time::timeout(self.close_timeout, self.engine.close_position(ticket, volume)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(ticket, millis, "Close request timed out");
                            CloseResult::timed_out(millis)
                        }
                    };
                ActionOutcome::Closed {
                    action: job.action,
                    result,
                    guard: job.guard,
                }
            }
            ExitAction::ModifyStop {
                ticket,
                side,
                new_stop_loss,
                ..
            } => {
                let accepted = modify_stop_with_retry(
                    self.engine.as_ref(),
                    self.feed.as_ref(),
                    ticket,
                    side,
                    new_stop_loss,
                    &self.retry,
                )
                .await;
                ActionOutcome::StopModified {
                    action: job.action,
                    accepted,
                }
            }
        };

        if self.outcomes.send(outcome).is_err() {
            debug!("Outcome receiver dropped");
        }
    }
}

/// Owns the dispatch queue and its worker task.
pub struct Dispatcher {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    executor: Executor,
    in_flight: InFlightRegistry,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        engine: Arc<dyn ExecutionEngine>,
        feed: Arc<dyn MarketFeed>,
        config: &DispatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ActionOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));

        let executor = Executor {
            engine,
            feed,
            close_timeout: Duration::from_millis(config.close_timeout_ms),
            retry: config.retry.clone(),
            outcomes: outcome_tx,
        };

        let worker_exec = executor.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                worker_exec.run(job).await;
            }
            debug!("Dispatch worker drained and stopped");
        });

        info!(capacity = config.queue_capacity, "Dispatch worker started");

        (
            Self {
                tx: Some(tx),
                worker: Some(worker),
                executor,
                in_flight: InFlightRegistry::new(),
                enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            },
            outcome_rx,
        )
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Queue one action. Close actions for an in-flight ticket are rejected
    /// with `ExecutionError::InFlight`.
    pub async fn submit(&self, action: ExitAction) -> Result<(), ExecutionError> {
        let guard = if action.is_close() {
            Some(self.in_flight.try_acquire(action.ticket())?)
        } else {
            None
        };

        let tx = self.tx.as_ref().ok_or(ExecutionError::QueueClosed)?;
        match tx.send_timeout(Job { action, guard }, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(job)) => {
                warn!(ticket = job.action.ticket(), "Dispatch queue full — executing inline");
                self.executor.run(job).await;
                Ok(())
            }
            Err(SendTimeoutError::Closed(job)) => {
                error!(ticket = job.action.ticket(), "Dispatch queue closed — action dropped");
                Err(ExecutionError::QueueClosed)
            }
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Dispatch worker panicked");
            }
        }
        info!("Dispatcher shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
