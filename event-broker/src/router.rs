use std::sync::{Arc, Mutex, PoisonError};

use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, trace, warn};

use crate::{
    classify::{classify, Classified},
    message::{Envelope, Event, IndexedEvent},
    registry::{ConnectionId, ConnectionRegistry, Outbound},
    store::EventStore,
};

/// What the router did with one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Published { index: u64, recipients: usize },
    History { events: usize },
    Ignored,
}

/// Dispatches classified messages to the store and the registry.
pub struct Router {
    store: Arc<dyn EventStore>,
    registry: Arc<ConnectionRegistry>,
    // Held across append + fan-out so every recipient sees broadcasts in index order.
    publish: Mutex<()>,
}

impl Router {
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            publish: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handles one text payload received from `from`.
    ///
    /// Publishes are echoed verbatim, so the original text is passed in rather
    /// than re-encoded from the parsed message.
    pub fn route(&self, from: ConnectionId, raw: Utf8Bytes) -> Route {
        match classify(raw.as_str()) {
            Classified::Single { message } => self.publish(from, message, raw),
            Classified::HistoryRequest => self.reply_with_history(from),
            Classified::Unclassified => {
                trace!(connection = from, "ignoring unclassified message");
                Route::Ignored
            }
        }
    }

    /// Stores the whole `{class, event}` message so history replays what was sent.
    fn publish(&self, from: ConnectionId, message: Event, raw: Utf8Bytes) -> Route {
        let _ordered = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let IndexedEvent { index, .. } = self.store.append(message);
        let recipients = self.registry.broadcast(&raw);
        debug!(connection = from, index, recipients, "event published");
        Route::Published { index, recipients }
    }

    fn reply_with_history(&self, to: ConnectionId) -> Route {
        let events = self.store.get_all();
        let count = events.len();
        let response = match (Envelope::HistoryResponse { events }).to_json() {
            Ok(json) => json,
            Err(error) => {
                warn!(connection = to, %error, "failed to encode history response");
                return Route::Ignored;
            }
        };

        if !self
            .registry
            .send_to(to, Outbound::Text(Utf8Bytes::from(response)))
        {
            debug!(connection = to, "requester left before history was delivered");
        }
        debug!(connection = to, events = count, "history sent");
        Route::History { events: count }
    }
}
