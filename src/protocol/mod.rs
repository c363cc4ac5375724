//! # Sub-protocol Multiplexer
//!
//! Four sub-protocols share one wire stream, each owning its own id space:
//!
//! - **Control** (`con`): heartbeat and liveness
//! - **Communication** (`com`): parameter and key negotiation, pause/resume
//! - **Data** (`data`): correlated request/response exchange
//! - **Subscription** (`sub`): publish/subscribe notification
//!
//! Inbound bulks are dispatched by `(direction, kind)`; both tags are
//! closed enums, so an unrecognized combination cannot exist past
//! deserialization. Within one kind, bulks are processed in arrival order;
//! there is no cross-kind ordering guarantee.

pub mod communication;
pub mod control;
pub mod data;
pub mod ids;
pub mod subscription;

pub use communication::{
    AfterSend, CommunicationBody, CommunicationProtocol, Negotiation, ProcessedRequest,
    ProcessedResponse,
};
pub use control::{ControlBody, ControlProtocol};
pub use data::{DataProtocol, EnqueueFn, MemoryCache, PendingReply, RequestCache};
pub use ids::IdAllocator;
pub use subscription::{SubscriptionBody, SubscriptionProtocol};

use serde_json::Value;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::utils::Metrics;

/// Capabilities the owner of a connection plugs into the protocol engine.
///
/// One object carries every callback; mock it to test a connection without
/// a live data layer. `handle_request` and `rework_response` run on the
/// connection's worker pool, the subscription hooks run on the loop task
/// and must stay cheap.
pub trait ConnectionHandlers: Send + Sync + 'static {
    /// Answer one inbound data request
    fn handle_request(&self, request: Value) -> Value;

    /// Post-process a data response before its pending handle resolves
    fn rework_response(&self, response: Value) -> Value {
        response
    }

    /// A peer subscribed to `shape`
    fn subscription_added(&self, shape: &Value) {
        let _ = shape;
    }

    /// A peer unsubscribed from `shape`
    fn subscription_removed(&self, shape: &Value) {
        let _ = shape;
    }

    /// An unsolicited notification arrived for `shape`
    fn notification(&self, shape: &Value, value: &Value) {
        let _ = (shape, value);
    }
}

/// The four sub-protocols of one connection.
///
/// Data, subscription, and control are shared with the owner task (request
/// issuing); communication belongs to the loop alone.
pub struct ProtocolSet {
    pub data: Arc<DataProtocol>,
    pub subscription: Arc<SubscriptionProtocol>,
    pub communication: CommunicationProtocol,
    pub control: Arc<ControlProtocol>,
}

impl ProtocolSet {
    pub fn new(
        config: &ConnectionConfig,
        cache: Option<Arc<dyn RequestCache>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            data: Arc::new(DataProtocol::new(
                config.id_start,
                config.id_end,
                cache,
                metrics,
            )?),
            subscription: Arc::new(SubscriptionProtocol::new(config.id_start, config.id_end)?),
            communication: CommunicationProtocol::new(config.id_start, config.id_end)?,
            control: Arc::new(ControlProtocol::new(config.id_start, config.id_end)?),
        })
    }
}
