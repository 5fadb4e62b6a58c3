// =============================================================================
// Position Arena — ticket-scoped state shared by every exit strategy
// =============================================================================
//
// One arena per coordinator/selector. Each ticket owns a TicketEntry holding
// the running excursion tracker plus one opaque slot per strategy namespace.
// A strategy only ever sees its own slot through a StrategyScope.
//
// Locking: the outer map lock is held only for lookup/insert; evaluation
// holds the per-ticket lock, so different tickets never contend.
// =============================================================================

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::{PeakTracker, PositionContext};
use crate::error::StrategyError;
use crate::types::{Position, Ticket};

type Slot = Box<dyn Any + Send>;

// =============================================================================
// TicketEntry
// =============================================================================

/// All engine-side state for one open ticket.
#[derive(Default)]
pub struct TicketEntry {
    pub peak: PeakTracker,
    namespaces: HashMap<String, Slot>,
}

impl std::fmt::Debug for TicketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketEntry")
            .field("peak", &self.peak)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TicketEntry {
    /// Borrow the slot belonging to `namespace`.
    pub fn scope<'a>(&'a mut self, namespace: &'a str) -> StrategyScope<'a> {
        StrategyScope {
            namespace,
            slots: &mut self.namespaces,
        }
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }
}

// =============================================================================
// StrategyScope
// =============================================================================

/// Read/write view of a single strategy's slot for one ticket.
pub struct StrategyScope<'a> {
    namespace: &'a str,
    slots: &'a mut HashMap<String, Slot>,
}

impl<'a> StrategyScope<'a> {
    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// The strategy's state, created with `T::default()` on first access.
    ///
    /// A slot holding a different type is replaced; two strategies sharing a
    /// name is a registration mistake, not something to fail the tick over.
    pub fn state<T: Default + Send + 'static>(&mut self) -> Result<&mut T, StrategyError> {
        let namespace = self.namespace;
        let slot = self
            .slots
            .entry(namespace.to_string())
            .or_insert_with(|| Box::new(T::default()));

        if !(**slot).is::<T>() {
            warn!(namespace, "State slot type mismatch — resetting slot");
            *slot = Box::new(T::default());
        }

        let any: &mut (dyn Any + Send) = slot.as_mut();
        any.downcast_mut::<T>().ok_or_else(|| StrategyError::StateType {
            strategy: namespace.to_string(),
        })
    }

    /// Existing state, if any was created and has type `T`.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.slots
            .get(self.namespace)
            .and_then(|slot| (**slot).downcast_ref::<T>())
    }

    /// Drop this strategy's state for the ticket.
    pub fn clear(&mut self) {
        self.slots.remove(self.namespace);
    }
}

// =============================================================================
// PositionArena
// =============================================================================

/// Ticket-keyed state arena.
#[derive(Debug, Default)]
pub struct PositionArena {
    tickets: Mutex<HashMap<Ticket, Arc<Mutex<TicketEntry>>>>,
}

impl PositionArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, ticket: Ticket) -> Arc<Mutex<TicketEntry>> {
        let mut map = self.tickets.lock();
        Arc::clone(map.entry(ticket).or_default())
    }

    /// Run `f` with exclusive access to the ticket's entry, creating it if needed.
    pub fn with_ticket<R>(&self, ticket: Ticket, f: impl FnOnce(&mut TicketEntry) -> R) -> R {
        let entry = self.entry(ticket);
        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// Feed the latest snapshot into the ticket's peak tracker and derive the
    /// position context for this tick.
    pub fn observe(&self, position: &Position, now: DateTime<Utc>) -> PositionContext {
        self.with_ticket(position.ticket, |entry| {
            entry.peak.observe(position);
            PositionContext::derive(position, &entry.peak, now)
        })
    }

    pub fn peak(&self, ticket: Ticket) -> Option<PeakTracker> {
        let entry = self.tickets.lock().get(&ticket).cloned()?;
        let guard = entry.lock();
        Some(guard.peak.clone())
    }

    pub fn contains(&self, ticket: Ticket) -> bool {
        self.tickets.lock().contains_key(&ticket)
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all state for a ticket. Returns whether anything was held.
    pub fn unregister(&self, ticket: Ticket) -> bool {
        let removed = self.tickets.lock().remove(&ticket).is_some();
        if removed {
            debug!(ticket, "Arena state dropped");
        }
        removed
    }

    /// Drop state for every ticket not in `open`. Returns the removed tickets.
    pub fn retain_open(&self, open: &HashSet<Ticket>) -> Vec<Ticket> {
        let mut map = self.tickets.lock();
        let stale: Vec<Ticket> = map.keys().filter(|t| !open.contains(t)).copied().collect();
        for ticket in &stale {
            map.remove(ticket);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Arena swept closed tickets");
        }
        stale
    }
}

// =============================================================================
// Tests
// =============================================================================
