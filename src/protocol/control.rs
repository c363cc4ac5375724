//! Control sub-protocol: heartbeat and liveness.
//!
//! Two message types: `ping` asks the peer to answer, `alive` is an
//! unsolicited heartbeat expecting no reply. Receiving either refreshes
//! the receiver's lease; the owning connection loop (not this layer)
//! closes the connection when the lease runs out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tracing::warn;

use super::ids::IdAllocator;
use crate::core::{Bulk, Direction, Kind, Message, UNSOLICITED_ID};
use crate::error::Result;

/// Body of a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlBody {
    /// "Are you alive"; the peer answers with a `pong`
    Ping,
    /// Answer to a `ping`
    Pong,
    /// Unsolicited heartbeat, no reply expected
    Alive,
}

/// Builder/handler for control bulks.
///
/// Callable from both the owner task (`ping`) and the connection loop
/// (heartbeats, processing), so the id allocator sits behind a mutex.
pub struct ControlProtocol {
    ids: Mutex<IdAllocator>,
}

impl ControlProtocol {
    pub fn new(id_start: u32, id_end: u32) -> Result<Self> {
        Ok(Self {
            ids: Mutex::new(IdAllocator::new(id_start, id_end)?),
        })
    }

    /// Unsolicited heartbeat bulk
    pub fn request_alive(&self) -> Bulk {
        single(Direction::Request, UNSOLICITED_ID, ControlBody::Alive)
    }

    /// Liveness probe bulk; the peer answers with a `pong`
    pub fn request_ping(&self) -> Result<Bulk> {
        let id = self
            .ids
            .lock()
            .map_err(|_| crate::error::ProtocolError::Custom("id allocator poisoned".into()))?
            .allocate()?;
        Ok(single(Direction::Request, id, ControlBody::Ping))
    }

    /// Handle an inbound control request, producing the reply to queue (if
    /// any). Malformed bodies are logged and skipped, never fatal.
    pub fn process_request(&self, bulk: &Bulk) -> Option<Bulk> {
        let mut replies = Vec::new();
        for message in &bulk.data {
            match parse_body(&message.data) {
                Some(ControlBody::Ping) => {
                    replies.push(body_message(message.id, ControlBody::Pong));
                }
                Some(ControlBody::Alive) => {}
                Some(ControlBody::Pong) => {
                    warn!(id = message.id, "pong arrived as a request; ignoring");
                }
                None => {
                    warn!(id = message.id, "malformed control body; skipping");
                }
            }
        }

        if replies.is_empty() {
            None
        } else {
            Some(Bulk::new(Kind::Control, Direction::Response, replies))
        }
    }

    /// Handle an inbound control response, settling the ping it answers.
    /// The lease refresh happens at the connection for every control bulk.
    pub fn process_response(&self, bulk: &Bulk) {
        for message in &bulk.data {
            match parse_body(&message.data) {
                Some(ControlBody::Pong) => {
                    let released = self
                        .ids
                        .lock()
                        .map(|mut ids| ids.release(message.id))
                        .unwrap_or(false);
                    if !released {
                        warn!(id = message.id, "pong for unknown ping; skipping");
                    }
                }
                Some(ControlBody::Ping) | Some(ControlBody::Alive) => {}
                None => {
                    warn!(id = message.id, "malformed control body; skipping");
                }
            }
        }
    }
}

fn parse_body(data: &Value) -> Option<ControlBody> {
    serde_json::from_value(data.clone()).ok()
}

fn body_message(id: u32, body: ControlBody) -> Message {
    let value = serde_json::to_value(body).unwrap_or(Value::Null);
    Message::new(id, value)
}

fn single(direction: Direction, id: u32, body: ControlBody) -> Bulk {
    let value = serde_json::to_value(body).unwrap_or(Value::Null);
    Bulk::single(Kind::Control, direction, id, value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::DEFAULT_ID_RANGE;

    fn proto() -> ControlProtocol {
        ControlProtocol::new(DEFAULT_ID_RANGE.0, DEFAULT_ID_RANGE.1).unwrap()
    }

    #[test]
    fn alive_is_a_request_with_no_reply() {
        let control = proto();
        let bulk = control.request_alive();
        assert_eq!(bulk.kind, Kind::Control);
        assert_eq!(bulk.direction, Direction::Request);
        assert_eq!(bulk.data[0].id, UNSOLICITED_ID);

        assert!(control.process_request(&bulk).is_none());
    }

    #[test]
    fn ping_yields_pong_with_same_id() {
        let requester = proto();
        let responder = proto();

        let ping = requester.request_ping().unwrap();
        let reply = responder.process_request(&ping).unwrap();

        assert_eq!(reply.kind, Kind::Control);
        assert_eq!(reply.direction, Direction::Response);
        assert_eq!(reply.data.len(), 1);
        assert_eq!(reply.data[0].id, ping.data[0].id);
        let body: ControlBody = serde_json::from_value(reply.data[0].data.clone()).unwrap();
        assert_eq!(body, ControlBody::Pong);

        // The requester settles the pong against its allocator.
        requester.process_response(&reply);
        let next = requester.request_ping().unwrap();
        assert_eq!(next.data[0].id, ping.data[0].id + 1);
    }

    #[test]
    fn malformed_body_is_skipped() {
        let control = proto();
        let bulk = Bulk::single(
            Kind::Control,
            Direction::Request,
            7,
            serde_json::json!({"op": "explode"}),
        );
        assert!(control.process_request(&bulk).is_none());
    }

    #[test]
    fn mixed_bulk_replies_only_to_pings() {
        let control = proto();
        let bulk = Bulk::new(
            Kind::Control,
            Direction::Request,
            vec![
                Message::new(UNSOLICITED_ID, serde_json::json!({"op": "alive"})),
                Message::new(55, serde_json::json!({"op": "ping"})),
            ],
        );
        let reply = control.process_request(&bulk).unwrap();
        assert_eq!(reply.data.len(), 1);
        assert_eq!(reply.data[0].id, 55);
    }
}
