//! Subscription sub-protocol: publish/subscribe notification.
//!
//! Symmetric add/remove/notify messages. Inbound add and remove requests
//! invoke the owner's capability hooks and are acknowledged; a notify is an
//! unsolicited server-to-client push carried in a response-direction bulk,
//! answering no request and needing no outstanding id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tracing::warn;

use super::ids::IdAllocator;
use super::ConnectionHandlers;
use crate::core::{Bulk, Direction, Kind, Message, UNSOLICITED_ID};
use crate::error::Result;

/// Body of a subscription message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SubscriptionBody {
    /// Start delivering notifications matching `shape`
    Add { shape: Value },
    /// Stop delivering notifications matching `shape`
    Remove { shape: Value },
    /// Unsolicited push of `value` for subscribers of `shape`
    Notify { shape: Value, value: Value },
    /// Acknowledgement of an add/remove
    Ack,
}

/// Builder/handler for subscription bulks.
///
/// Callable from both the owner task (request builders, `notify`) and the
/// connection loop (processing), so the id allocator sits behind a mutex.
pub struct SubscriptionProtocol {
    ids: Mutex<IdAllocator>,
}

impl SubscriptionProtocol {
    pub fn new(id_start: u32, id_end: u32) -> Result<Self> {
        Ok(Self {
            ids: Mutex::new(IdAllocator::new(id_start, id_end)?),
        })
    }

    /// Request delivery of notifications matching `shape`
    pub fn request_add(&self, shape: Value) -> Result<Bulk> {
        self.single_request(SubscriptionBody::Add { shape })
    }

    /// Request an end to notifications matching `shape`
    pub fn request_remove(&self, shape: Value) -> Result<Bulk> {
        self.single_request(SubscriptionBody::Remove { shape })
    }

    /// Unsolicited push bulk for subscribers of `shape`
    pub fn notify(&self, shape: Value, value: Value) -> Result<Bulk> {
        let body = SubscriptionBody::Notify { shape, value };
        let value = serde_json::to_value(&body)
            .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string()))?;
        Ok(Bulk::single(
            Kind::Subscription,
            Direction::Response,
            UNSOLICITED_ID,
            value,
        ))
    }

    /// Handle inbound add/remove requests, invoking the owner's hooks and
    /// producing one acknowledgement bulk.
    pub fn process_request(&self, bulk: &Bulk, handlers: &dyn ConnectionHandlers) -> Option<Bulk> {
        let mut acks = Vec::new();

        for message in &bulk.data {
            match parse_body(&message.data) {
                Some(SubscriptionBody::Add { shape }) => {
                    handlers.subscription_added(&shape);
                    acks.push(ack_message(message.id));
                }
                Some(SubscriptionBody::Remove { shape }) => {
                    handlers.subscription_removed(&shape);
                    acks.push(ack_message(message.id));
                }
                Some(SubscriptionBody::Notify { .. }) => {
                    warn!(id = message.id, "notify arrived as a request; ignoring");
                }
                Some(SubscriptionBody::Ack) | None => {
                    warn!(id = message.id, "malformed subscription body; skipping");
                }
            }
        }

        if acks.is_empty() {
            None
        } else {
            Some(Bulk::new(Kind::Subscription, Direction::Response, acks))
        }
    }

    /// Handle inbound responses: acknowledgements settle their ids,
    /// notifies are delivered to the owner's notification hook.
    pub fn process_response(&self, bulk: &Bulk, handlers: &dyn ConnectionHandlers) {
        for message in &bulk.data {
            match parse_body(&message.data) {
                Some(SubscriptionBody::Ack) => {
                    let released = self
                        .ids
                        .lock()
                        .map(|mut ids| ids.release(message.id))
                        .unwrap_or(false);
                    if !released {
                        warn!(
                            id = message.id,
                            "subscription ack for unknown request; skipping"
                        );
                    }
                }
                Some(SubscriptionBody::Notify { shape, value }) => {
                    handlers.notification(&shape, &value);
                }
                Some(SubscriptionBody::Add { .. }) | Some(SubscriptionBody::Remove { .. }) => {
                    warn!(
                        id = message.id,
                        "add/remove arrived as a response; ignoring"
                    );
                }
                None => {
                    warn!(id = message.id, "malformed subscription body; skipping");
                }
            }
        }
    }

    fn single_request(&self, body: SubscriptionBody) -> Result<Bulk> {
        let id = self
            .ids
            .lock()
            .map_err(|_| crate::error::ProtocolError::Custom("id allocator poisoned".into()))?
            .allocate()?;
        let value = serde_json::to_value(&body)
            .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string()))?;
        Ok(Bulk::single(Kind::Subscription, Direction::Request, id, value))
    }
}

fn parse_body(data: &Value) -> Option<SubscriptionBody> {
    serde_json::from_value(data.clone()).ok()
}

fn ack_message(id: u32) -> Message {
    let value = serde_json::to_value(SubscriptionBody::Ack).unwrap_or(Value::Null);
    Message::new(id, value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::DEFAULT_ID_RANGE;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandlers {
        added: StdMutex<Vec<Value>>,
        removed: StdMutex<Vec<Value>>,
        notified: StdMutex<Vec<(Value, Value)>>,
    }

    impl ConnectionHandlers for RecordingHandlers {
        fn handle_request(&self, request: Value) -> Value {
            request
        }

        fn subscription_added(&self, shape: &Value) {
            self.added.lock().unwrap().push(shape.clone());
        }

        fn subscription_removed(&self, shape: &Value) {
            self.removed.lock().unwrap().push(shape.clone());
        }

        fn notification(&self, shape: &Value, value: &Value) {
            self.notified
                .lock()
                .unwrap()
                .push((shape.clone(), value.clone()));
        }
    }

    fn proto() -> SubscriptionProtocol {
        SubscriptionProtocol::new(DEFAULT_ID_RANGE.0, DEFAULT_ID_RANGE.1).unwrap()
    }

    #[test]
    fn add_invokes_hook_and_acks() {
        let subs = proto();
        let handlers = RecordingHandlers::default();

        let request = subs.request_add(json!({"topic": "prices"})).unwrap();
        let ack = subs.process_request(&request, &handlers).unwrap();

        assert_eq!(handlers.added.lock().unwrap().len(), 1);
        assert_eq!(ack.direction, Direction::Response);
        assert_eq!(ack.data[0].id, request.data[0].id);

        // The requester settles the ack against its allocator.
        subs.process_response(&ack, &handlers);
    }

    #[test]
    fn remove_invokes_hook() {
        let subs = proto();
        let handlers = RecordingHandlers::default();

        let request = subs.request_remove(json!({"topic": "prices"})).unwrap();
        subs.process_request(&request, &handlers);
        assert_eq!(handlers.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn notify_is_unsolicited_response() {
        let subs = proto();
        let handlers = RecordingHandlers::default();

        let push = subs.notify(json!({"topic": "prices"}), json!(42)).unwrap();
        assert_eq!(push.direction, Direction::Response);
        assert_eq!(push.kind, Kind::Subscription);
        assert_eq!(push.data[0].id, UNSOLICITED_ID);

        subs.process_response(&push, &handlers);
        let notified = handlers.notified.lock().unwrap();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].1, json!(42));
    }

    #[test]
    fn malformed_body_is_skipped() {
        let subs = proto();
        let handlers = RecordingHandlers::default();
        let bad = Bulk::single(
            Kind::Subscription,
            Direction::Request,
            9,
            json!({"op": "subscribe-all"}),
        );
        assert!(subs.process_request(&bad, &handlers).is_none());
    }
}
