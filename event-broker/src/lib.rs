//! WebSocket event broker.
//!
//! Clients publish opaque JSON events; the broker appends each one to an
//! ordered log and echoes it to every connected client. A client can also ask
//! for the whole log. See `README.md` for the wire protocol.
//!
//! - [`store`] is the append-only event log behind the [`store::EventStore`] trait.
//! - [`classify`] tags raw payloads as publish, history request or noise.
//! - [`router`] appends and fans out publishes, answers history requests.
//! - [`registry`] tracks connected clients and their outbound queues.
//! - [`connection`] drives one WebSocket session.
//! - [`broker`] binds the listener and runs the shutdown sequence.
//! - [`client`] and [`cli`] provide the command-line front end.

pub mod broker;
pub mod classify;
pub mod cli;
pub mod client;
pub mod connection;
pub mod message;
pub mod registry;
pub mod router;
pub mod store;

pub use broker::{close_broker, new_broker, Broker, BrokerConfig, LifecycleState, ShutdownReport};
pub use message::{Envelope, Event, IndexedEvent};
pub use store::{EventStore, MemoryStore};
