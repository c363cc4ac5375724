//! Wire-level message model.
//!
//! A [`Bulk`] is the envelope actually written to the socket: one or more
//! [`Message`]s that all share the bulk's direction and kind. The payload of
//! each message is opaque to this layer; sub-protocols interpret it.
//!
//! Serialized form (JSON, field names are wire-exact):
//!
//! ```text
//! Bulk    := { "time": f64, "data": [Message], "direction": "request"|"response",
//!              "kind": "data"|"sub"|"com"|"con" }
//! Message := { "time": f64, "data": <opaque>, "id": u32 }
//! ```
//!
//! Direction and kind are closed enums; an unrecognized tag fails
//! deserialization instead of silently falling through a string match.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::time::unix_now;

/// Whether a bulk initiates an exchange or answers one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// Which sub-protocol owns a bulk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Correlated request/response data exchange
    #[serde(rename = "data")]
    Data,
    /// Publish/subscribe notification
    #[serde(rename = "sub")]
    Subscription,
    /// Connection-parameter and key negotiation
    #[serde(rename = "com")]
    Communication,
    /// Heartbeat and liveness
    #[serde(rename = "con")]
    Control,
}

/// One logical unit of payload inside a bulk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Construction time, fractional unix seconds
    pub time: f64,
    /// Opaque payload owned by the sub-protocol / data layer
    pub data: Value,
    /// Correlation id; requests draw it from the allocator, responses echo
    /// the request's id, unsolicited pushes carry 0
    pub id: u32,
}

impl Message {
    /// Message stamped with the current time
    pub fn new(id: u32, data: Value) -> Self {
        Self {
            time: unix_now(),
            data,
            id,
        }
    }
}

/// Id carried by unsolicited (push) messages that answer no request
pub const UNSOLICITED_ID: u32 = 0;

/// The wire-level envelope holding one or more same-kind, same-direction
/// messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bulk {
    /// Construction time, fractional unix seconds
    pub time: f64,
    /// The messages; every one shares this bulk's direction and kind
    pub data: Vec<Message>,
    pub direction: Direction,
    pub kind: Kind,
}

impl Bulk {
    /// Bulk stamped with the current time
    pub fn new(kind: Kind, direction: Direction, data: Vec<Message>) -> Self {
        Self {
            time: unix_now(),
            data,
            direction,
            kind,
        }
    }

    /// Bulk carrying a single message
    pub fn single(kind: Kind, direction: Direction, id: u32, payload: Value) -> Self {
        Self::new(kind, direction, vec![Message::new(id, payload)])
    }

    /// Serialize to the wire representation
    pub fn to_wire(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string()))
    }

    /// Parse from the wire representation
    pub fn from_wire(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::ProtocolError::Framing(format!("malformed bulk: {e}")))
    }
}
