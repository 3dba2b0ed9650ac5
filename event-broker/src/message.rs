use serde::{Deserialize, Serialize};

/// Opaque event payload. The broker stores and forwards it without looking inside.
pub type Event = serde_json::Value;

/// A stored value paired with the position the store assigned to it.
///
/// The broker stores each published `{class: "single", event}` message whole,
/// so `event` here holds that message rather than just its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedEvent {
    pub index: u64,
    pub event: Event,
}

/// Typed view of the JSON protocol spoken over the WebSocket.
///
/// The broker itself only builds `HistoryResponse` values; inbound traffic goes
/// through [`crate::classify`] so that unknown or malformed payloads can be
/// dropped instead of failing deserialization. Clients use this enum in both
/// directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "class", rename_all = "camelCase")]
pub enum Envelope {
    Single { event: Event },
    HistoryRequest,
    HistoryResponse { events: Vec<IndexedEvent> },
}

impl Envelope {
    pub fn single(event: Event) -> Self {
        Envelope::Single { event }
    }

    pub fn history_request() -> Self {
        Envelope::HistoryRequest
    }

    pub fn is_history_response(&self) -> bool {
        matches!(self, Envelope::HistoryResponse { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
