// =============================================================================
// In-flight registry — at most one close per ticket on the wire
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ExecutionError;
use crate::types::Ticket;

/// Tickets with a close request currently outstanding.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    tickets: Arc<Mutex<HashSet<Ticket>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `ticket` in flight. Fails if it already is; the caller must then
    /// drop the decision rather than queue it.
    pub fn try_acquire(&self, ticket: Ticket) -> Result<InFlightGuard, ExecutionError> {
        if !self.tickets.lock().insert(ticket) {
            return Err(ExecutionError::InFlight(ticket));
        }
        debug!(ticket, "Ticket marked in flight");
        Ok(InFlightGuard {
            ticket,
            tickets: Arc::clone(&self.tickets),
        })
    }

    pub fn contains(&self, ticket: Ticket) -> bool {
        self.tickets.lock().contains(&ticket)
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the ticket when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    ticket: Ticket,
    tickets: Arc<Mutex<HashSet<Ticket>>>,
}

impl InFlightGuard {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tickets.lock().remove(&self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_acquire_is_rejected_until_guard_drops() {
        let registry = InFlightRegistry::new();
        let guard = registry.try_acquire(5).unwrap();
        assert_eq!(registry.try_acquire(5).unwrap_err(), ExecutionError::InFlight(5));
        assert!(registry.try_acquire(6).is_ok());
        assert!(registry.contains(5));
        drop(guard);
        assert!(!registry.contains(5));
        assert!(registry.try_acquire(5).is_ok());
    }
}
