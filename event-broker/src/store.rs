//! Ordered, append-only event log backing the broker.
//!
//! The broker only depends on the [`EventStore`] contract: every append gets
//! the next index starting at zero, and reads return entries in append order.
//! Any backend that keeps that contract can be injected at startup.

use std::sync::{Mutex, PoisonError};

use crate::message::{Event, IndexedEvent};

/// Pluggable persistence for published events.
///
/// Implementations are shared between connection tasks, so both methods take
/// `&self` and must synchronise internally.
pub trait EventStore: Send + Sync {
    /// Stores `event` under the next sequential index and returns the stored pair.
    fn append(&self, event: Event) -> IndexedEvent;

    /// Returns every stored entry in append order without consuming anything.
    fn get_all(&self) -> Vec<IndexedEvent>;

    fn len(&self) -> usize {
        self.get_all().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default in-memory backend.
///
/// A single `Mutex<Vec<_>>` keeps index assignment and insertion in one
/// critical section, so indices can never gap or repeat even when several
/// connection tasks publish at once.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<IndexedEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, event: Event) -> IndexedEvent {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let indexed = IndexedEvent {
            index: entries.len() as u64,
            event,
        };
        entries.push(indexed.clone());
        indexed
    }

    /// Clones the log so the lock is not held while the caller serialises it.
    fn get_all(&self) -> Vec<IndexedEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
