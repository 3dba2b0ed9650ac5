//! Membership of connected clients.
//!
//! Each connection task owns the receiving end of an unbounded queue; the
//! registry keeps the sending end. Fan-out is therefore a non-blocking push
//! per recipient and never waits on a slow socket while the lock is held.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Work queued for a single connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Utf8Bytes),
    /// Start the close handshake.
    Close,
}

struct ConnectionEntry {
    peer: SocketAddr,
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct Members {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    accepting: bool,
}

pub struct ConnectionRegistry {
    members: Mutex<Members>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Members {
                connections: HashMap::new(),
                accepting: true,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a connection in the `Connecting` state.
    ///
    /// Returns `false` when the id is already present or the broker is
    /// shutting down; the caller should drop the connection in that case.
    pub fn register(
        &self,
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        let mut members = self.members();
        if !members.accepting || members.connections.contains_key(&id) {
            return false;
        }
        members.connections.insert(
            id,
            ConnectionEntry {
                peer,
                state: ConnectionState::Connecting,
                outbound,
            },
        );
        true
    }

    /// Moves a connection from `Connecting` to `Open` so it starts receiving
    /// broadcasts. Fails if the connection is gone or already closing.
    pub fn mark_open(&self, id: ConnectionId) -> bool {
        let mut members = self.members();
        match members.connections.get_mut(&id) {
            Some(entry) if entry.state == ConnectionState::Connecting => {
                entry.state = ConnectionState::Open;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.members()
            .connections
            .remove(&id)
            .map(|entry| entry.peer)
    }

    /// Unknown ids report `Closed`.
    pub fn state_of(&self, id: ConnectionId) -> ConnectionState {
        self.members()
            .connections
            .get(&id)
            .map_or(ConnectionState::Closed, |entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.members().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open_count(&self) -> usize {
        self.members()
            .connections
            .values()
            .filter(|entry| entry.state == ConnectionState::Open)
            .count()
    }

    /// Queues `text` for every `Open` connection and returns how many accepted it.
    ///
    /// Recipients whose task already went away are skipped.
    pub fn broadcast(&self, text: &Utf8Bytes) -> usize {
        let members = self.members();
        let mut delivered = 0;
        for (id, entry) in &members.connections {
            if entry.state != ConnectionState::Open {
                continue;
            }
            match entry.outbound.send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(connection = id, "skipping recipient with closed queue"),
            }
        }
        delivered
    }

    pub fn send_to(&self, id: ConnectionId, message: Outbound) -> bool {
        let members = self.members();
        match members.connections.get(&id) {
            Some(entry) => entry.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Stops accepting registrations and asks every member to close.
    ///
    /// Returns the number of close requests issued.
    pub fn begin_close(&self) -> usize {
        let mut members = self.members();
        members.accepting = false;
        let mut requested = 0;
        for (id, entry) in members.connections.iter_mut() {
            entry.state = ConnectionState::Closing;
            if entry.outbound.send(Outbound::Close).is_ok() {
                requested += 1;
            } else {
                debug!(connection = id, "connection already gone before close request");
            }
        }
        requested
    }

    /// Drops every entry. Used after connection tasks were aborted.
    pub fn clear(&self) -> usize {
        let mut members = self.members();
        let dropped = members.connections.len();
        members.connections.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn open_member(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let id = registry.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(registry.register(id, peer(), tx));
        assert!(registry.mark_open(id));
        (id, rx)
    }

    #[test]
    fn ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let first = registry.next_id();
        let second = registry.next_id();
        assert_ne!(first, second);
    }

    #[test]
    fn register_rejects_duplicate_ids() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.register(7, peer(), tx.clone()));
        assert!(!registry.register(7, peer(), tx));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lifecycle_states_follow_registration() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.next_id();

        assert_eq!(registry.state_of(id), ConnectionState::Closed);
        registry.register(id, peer(), tx);
        assert_eq!(registry.state_of(id), ConnectionState::Connecting);
        registry.mark_open(id);
        assert_eq!(registry.state_of(id), ConnectionState::Open);
        assert_eq!(registry.remove(id), Some(peer()));
        assert_eq!(registry.state_of(id), ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_skips_connecting_members() {
        let registry = ConnectionRegistry::new();
        let (_open_id, mut open_rx) = open_member(&registry);

        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel();
        let pending_id = registry.next_id();
        registry.register(pending_id, peer(), pending_tx);

        let delivered = registry.broadcast(&Utf8Bytes::from("hello"));
        assert_eq!(delivered, 1);
        assert_eq!(registry.open_count(), 1);
        assert_eq!(
            open_rx.try_recv().expect("open member receives"),
            Outbound::Text(Utf8Bytes::from("hello"))
        );
        assert!(pending_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_survives_dropped_receivers() {
        let registry = ConnectionRegistry::new();
        let (_gone, gone_rx) = open_member(&registry);
        let (_live, mut live_rx) = open_member(&registry);
        drop(gone_rx);

        let delivered = registry.broadcast(&Utf8Bytes::from("still here"));
        assert_eq!(delivered, 1);
        assert!(matches!(live_rx.try_recv(), Ok(Outbound::Text(_))));
    }

    #[test]
    fn send_to_targets_one_member() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = open_member(&registry);
        let (_second, mut second_rx) = open_member(&registry);

        assert!(registry.send_to(first, Outbound::Text(Utf8Bytes::from("only you"))));
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
        assert!(!registry.send_to(999, Outbound::Close));
    }

    #[test]
    fn begin_close_requests_close_and_blocks_new_members() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = open_member(&registry);

        assert_eq!(registry.begin_close(), 1);
        assert_eq!(registry.state_of(id), ConnectionState::Closing);
        assert_eq!(rx.try_recv().expect("close request"), Outbound::Close);
        assert_eq!(registry.broadcast(&Utf8Bytes::from("late")), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!registry.register(registry.next_id(), peer(), tx));
        assert!(!registry.mark_open(id));

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
