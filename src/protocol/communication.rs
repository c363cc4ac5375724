//! Communication sub-protocol: connection-parameter and key negotiation.
//!
//! Carries the pause/resume flow-control handshake and the three
//! renegotiations (key rotation, cryption-variant change, length-header
//! width change). Inbound requests are answered synchronously, with no
//! user callback involved, and hand the connection a set of side effects:
//! state transitions, an immediate receive-width change, and changes that
//! must apply only after the reply frame has been written (the cryption
//! commit and the send-width change), so that every frame on the wire is
//! readable with the transform and width its receiver currently holds.
//!
//! Inbound responses settle the requester's half: install the peer's key
//! into the staged transform and commit it, adopt the new receive width,
//! and signal the state machine that the round is satisfied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ids::IdAllocator;
use crate::core::{Bulk, Direction, Kind, Message};
use crate::crypto::{CryptionService, CryptionState, CryptionVariant};
use crate::error::Result;

/// A negotiation the local side wants to run.
///
/// Queued by the owner; the connection drains the queue one item per
/// pause/resume window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Ask the peer to rotate its key under the current variant
    KeyExchange,
    /// Switch to another cryption variant
    CryptionChange(CryptionVariant),
    /// Change the frame length-header width
    MaxBytes(usize),
}

/// Body of a communication message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommunicationBody {
    /// Key rotation; the request may carry the requester's share (needed
    /// for asymmetric agreement), the response carries the peer's
    KeyExchange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    /// Variant switch; both directions carry key material under the new
    /// variant
    Cryption {
        variant: CryptionVariant,
        key: String,
    },
    Pause,
    Resume,
    /// Length-header width change
    MaxBytes { width: usize },
}

/// Changes that must apply only after the reply frame is on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSend {
    /// Swap the staged cryption in as the active transform
    CommitCryption,
    /// Switch the encode-side length-header width
    SetSendWidth(usize),
}

/// Everything the connection must do with an inbound communication request
#[derive(Default)]
pub struct ProcessedRequest {
    /// Reply bulk to queue on the respond slot
    pub reply: Option<Bulk>,
    /// Transition to `Paused`
    pub pause: bool,
    /// Transition back to `Open`
    pub resume: bool,
    /// Decode-side width change, effective immediately (frames already
    /// buffered behind this one use the new width)
    pub set_recv_width: Option<usize>,
    /// Effects deferred to just after the reply frame is written
    pub after_send: Vec<AfterSend>,
}

/// Everything the connection must do with an inbound communication response
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedResponse {
    /// The in-flight negotiation round is settled; advance the state
    /// machine
    pub satisfied: bool,
    /// Decode-side width change, effective immediately
    pub set_recv_width: Option<usize>,
}

/// Builder/handler for communication bulks. Owned by the connection loop.
pub struct CommunicationProtocol {
    ids: IdAllocator,
}

impl CommunicationProtocol {
    pub fn new(id_start: u32, id_end: u32) -> Result<Self> {
        Ok(Self {
            ids: IdAllocator::new(id_start, id_end)?,
        })
    }

    /// Flow-control pause request opening a negotiation window
    pub fn request_pause(&mut self) -> Result<Bulk> {
        self.single_request(CommunicationBody::Pause)
    }

    /// Flow-control resume request closing the negotiation window
    pub fn request_resume(&mut self) -> Result<Bulk> {
        self.single_request(CommunicationBody::Resume)
    }

    /// Ask the peer to rotate its key under the active variant.
    ///
    /// Stages a replacement transform; for variants built on key agreement
    /// the request carries our fresh share.
    pub fn request_key_exchange(&mut self, cryption: &mut CryptionState) -> Result<Bulk> {
        let pending = cryption.stage_rotation();
        let key = match pending.variant() {
            CryptionVariant::Asymmetric => Some(pending.new_key()),
            CryptionVariant::Symmetric | CryptionVariant::None => None,
        };
        self.single_request(CommunicationBody::KeyExchange { key })
    }

    /// Ask the peer to switch cryption variants, carrying our key material
    /// under the new variant.
    pub fn request_cryption(
        &mut self,
        variant: CryptionVariant,
        cryption: &mut CryptionState,
    ) -> Result<Bulk> {
        let mut pending = CryptionService::create(variant);
        let key = pending.new_key();
        cryption.stage(pending);
        self.single_request(CommunicationBody::Cryption { variant, key })
    }

    /// Ask the peer to adopt a new length-header width.
    ///
    /// The caller stages its own send-width change to apply right after
    /// this request frame is written.
    pub fn request_max_bytes(&mut self, width: usize) -> Result<Bulk> {
        self.single_request(CommunicationBody::MaxBytes { width })
    }

    /// Answer an inbound communication request synchronously.
    ///
    /// # Errors
    /// Key-material failures bubble up and are fatal to the connection; a
    /// malformed body is skipped with a warning.
    pub fn process_request(
        &mut self,
        bulk: &Bulk,
        cryption: &mut CryptionState,
    ) -> Result<ProcessedRequest> {
        let mut outcome = ProcessedRequest::default();
        let mut replies = Vec::new();

        for message in &bulk.data {
            let Some(body) = parse_body(&message.data) else {
                warn!(id = message.id, "malformed communication body; skipping");
                continue;
            };

            match body {
                CommunicationBody::Pause => {
                    outcome.pause = true;
                    replies.push(reply_message(message.id, &CommunicationBody::Pause));
                }
                CommunicationBody::Resume => {
                    outcome.resume = true;
                    replies.push(reply_message(message.id, &CommunicationBody::Resume));
                }
                CommunicationBody::KeyExchange { key } => {
                    let pending = cryption.stage_rotation();
                    if let Some(share) = key.as_deref() {
                        pending.set_key(share)?;
                    }
                    let our_share = pending.new_key();
                    outcome.after_send.push(AfterSend::CommitCryption);
                    replies.push(reply_message(
                        message.id,
                        &CommunicationBody::KeyExchange {
                            key: Some(our_share),
                        },
                    ));
                }
                CommunicationBody::Cryption { variant, key } => {
                    debug!(?variant, "peer requested cryption change");
                    let mut pending = CryptionService::create(variant);
                    pending.set_key(&key)?;
                    let our_share = pending.new_key();
                    cryption.stage(pending);
                    outcome.after_send.push(AfterSend::CommitCryption);
                    replies.push(reply_message(
                        message.id,
                        &CommunicationBody::Cryption {
                            variant,
                            key: our_share,
                        },
                    ));
                }
                CommunicationBody::MaxBytes { width } => {
                    debug!(width, "peer requested frame width change");
                    outcome.set_recv_width = Some(width);
                    outcome.after_send.push(AfterSend::SetSendWidth(width));
                    replies.push(reply_message(
                        message.id,
                        &CommunicationBody::MaxBytes { width },
                    ));
                }
            }
        }

        if !replies.is_empty() {
            outcome.reply = Some(Bulk::new(Kind::Communication, Direction::Response, replies));
        }
        Ok(outcome)
    }

    /// Settle an inbound communication response on the requester side.
    ///
    /// # Errors
    /// Key-material failures bubble up and are fatal to the connection.
    pub fn process_response(
        &mut self,
        bulk: &Bulk,
        cryption: &mut CryptionState,
    ) -> Result<ProcessedResponse> {
        let mut outcome = ProcessedResponse::default();

        for message in &bulk.data {
            if !self.ids.release(message.id) {
                warn!(
                    id = message.id,
                    "communication response for unknown request; skipping"
                );
                continue;
            }

            let Some(body) = parse_body(&message.data) else {
                warn!(id = message.id, "malformed communication body; skipping");
                continue;
            };

            match body {
                CommunicationBody::Pause | CommunicationBody::Resume => {
                    outcome.satisfied = true;
                }
                CommunicationBody::KeyExchange { key } => {
                    if let Some(pending) = cryption.pending_mut() {
                        if let Some(share) = key.as_deref() {
                            pending.set_key(share)?;
                        }
                        cryption.commit();
                    } else {
                        warn!(id = message.id, "key exchange ack with nothing staged");
                    }
                    outcome.satisfied = true;
                }
                CommunicationBody::Cryption { variant, key } => {
                    if let Some(pending) = cryption.pending_mut() {
                        debug!(?variant, "peer confirmed cryption change");
                        pending.set_key(&key)?;
                        cryption.commit();
                    } else {
                        warn!(id = message.id, "cryption ack with nothing staged");
                    }
                    outcome.satisfied = true;
                }
                CommunicationBody::MaxBytes { width } => {
                    outcome.set_recv_width = Some(width);
                    outcome.satisfied = true;
                }
            }
        }

        Ok(outcome)
    }

    fn single_request(&mut self, body: CommunicationBody) -> Result<Bulk> {
        let id = self.ids.allocate()?;
        let value = serde_json::to_value(&body)
            .map_err(|e| crate::error::ProtocolError::SerializeError(e.to_string()))?;
        Ok(Bulk::single(Kind::Communication, Direction::Request, id, value))
    }
}

fn parse_body(data: &Value) -> Option<CommunicationBody> {
    serde_json::from_value(data.clone()).ok()
}

fn reply_message(id: u32, body: &CommunicationBody) -> Message {
    let value = serde_json::to_value(body).unwrap_or(Value::Null);
    Message::new(id, value)
}
