//! Data sub-protocol: correlated request/response exchange.
//!
//! `issue_request` allocates an id, parks a pending reply handle in the
//! correlation table, and hands back the request bulk for the send path.
//! If a configured cache already holds an answer, the handle resolves
//! synchronously instead and nothing touches the wire. Inbound
//! responses are matched against the table and resolved through the
//! caller's rework hook on the worker pool; inbound requests run the
//! caller's request hook once per item and yield exactly one response bulk
//! with the items in arrival order.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ids::IdAllocator;
use super::ConnectionHandlers;
use crate::core::{Bulk, Direction, Kind, Message};
use crate::error::{ProtocolError, Result};
use crate::utils::{Metrics, WorkerPool};

/// Pluggable answer cache consulted before a request touches the wire.
///
/// Requests are considered equivalent when their serialized payloads are
/// identical.
pub trait RequestCache: Send + Sync {
    /// A cached answer for `request`, if any
    fn lookup(&self, request: &Value) -> Option<Value>;
    /// Remember `response` as the answer for `request`
    fn store(&self, request: &Value, response: Value);
}

/// Unbounded in-memory cache keyed on the serialized request payload
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestCache for MemoryCache {
    fn lookup(&self, request: &Value) -> Option<Value> {
        let key = request.to_string();
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&key).cloned())
    }

    fn store(&self, request: &Value, response: Value) {
        let key = request.to_string();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, response);
        }
    }
}

/// Handle to a response that has not arrived yet.
///
/// Resolves when the matching response is processed; if the connection
/// closes first the handle reports `ConnectionClosed` instead of hanging.
pub struct PendingReply {
    rx: oneshot::Receiver<Value>,
}

impl PendingReply {
    /// Wait for the response payload
    pub async fn recv(self) -> Result<Value> {
        self.rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Non-blocking check, for callers polling from synchronous code
    pub fn try_recv(&mut self) -> Result<Option<Value>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(ProtocolError::ConnectionClosed),
        }
    }
}

struct PendingEntry {
    request: Value,
    tx: oneshot::Sender<Value>,
}

/// Sink for response bulks produced off the loop task (worker callbacks)
pub type EnqueueFn = Arc<dyn Fn(Bulk) + Send + Sync>;

/// Correlated request/response exchange over one connection
pub struct DataProtocol {
    ids: Mutex<IdAllocator>,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    cache: Option<Arc<dyn RequestCache>>,
    metrics: Arc<Metrics>,
}

impl DataProtocol {
    pub fn new(
        id_start: u32,
        id_end: u32,
        cache: Option<Arc<dyn RequestCache>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            ids: Mutex::new(IdAllocator::new(id_start, id_end)?),
            pending: Mutex::new(HashMap::new()),
            cache,
            metrics,
        })
    }

    /// Open a request: returns the bulk to send (None on a cache hit) and
    /// the handle its answer will resolve.
    pub fn issue_request(&self, payload: Value) -> Result<(Option<Bulk>, PendingReply)> {
        let (tx, rx) = oneshot::channel();
        let reply = PendingReply { rx };

        if let Some(cache) = &self.cache {
            if let Some(answer) = cache.lookup(&payload) {
                debug!("request served from cache");
                self.metrics.cache_hit();
                let _ = tx.send(answer);
                return Ok((None, reply));
            }
        }

        let id = self
            .ids
            .lock()
            .map_err(|_| ProtocolError::Custom("id allocator poisoned".into()))?
            .allocate()?;

        let bulk = Bulk::single(Kind::Data, Direction::Request, id, payload.clone());

        self.pending
            .lock()
            .map_err(|_| ProtocolError::Custom("correlation table poisoned".into()))?
            .insert(id, PendingEntry { request: payload, tx });

        Ok((Some(bulk), reply))
    }

    /// Abandon a request that never made it onto the wire (send failure)
    pub fn abort_request(&self, id: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        if let Ok(mut ids) = self.ids.lock() {
            ids.release(id);
        }
    }

    /// Resolve inbound responses against the correlation table.
    ///
    /// Each matched item runs the rework hook on the worker pool before the
    /// pending handle resolves; an unmatched id is reported, not fatal.
    pub async fn process_response(
        &self,
        bulk: Bulk,
        handlers: Arc<dyn ConnectionHandlers>,
        workers: &WorkerPool,
    ) -> Result<()> {
        for message in bulk.data {
            let entry = {
                let mut pending = self
                    .pending
                    .lock()
                    .map_err(|_| ProtocolError::Custom("correlation table poisoned".into()))?;
                pending.remove(&message.id)
            };

            let Some(entry) = entry else {
                warn!(
                    id = message.id,
                    error = %ProtocolError::MissingCorrelation(message.id),
                    "dropping uncorrelated data response"
                );
                self.metrics.correlation_miss();
                continue;
            };

            if let Ok(mut ids) = self.ids.lock() {
                ids.release(message.id);
            }

            let handlers = handlers.clone();
            let cache = self.cache.clone();
            workers
                .execute(move || {
                    let reworked = handlers.rework_response(message.data);
                    if let Some(cache) = cache {
                        cache.store(&entry.request, reworked.clone());
                    }
                    // Receiver may be gone; that is the owner's choice.
                    let _ = entry.tx.send(reworked);
                })
                .await?;
        }

        Ok(())
    }

    /// Answer inbound requests: the request hook runs once per item on the
    /// worker pool, and all answers leave as a single response bulk holding
    /// the items in arrival order.
    pub async fn process_request(
        &self,
        bulk: Bulk,
        handlers: Arc<dyn ConnectionHandlers>,
        workers: &WorkerPool,
        enqueue: EnqueueFn,
    ) -> Result<()> {
        if bulk.data.is_empty() {
            return Ok(());
        }

        workers
            .execute(move || {
                let answers = bulk
                    .data
                    .into_iter()
                    .map(|message| Message::new(message.id, handlers.handle_request(message.data)))
                    .collect();
                enqueue(Bulk::new(Kind::Data, Direction::Response, answers));
            })
            .await?;

        Ok(())
    }

    /// Number of requests awaiting responses
    pub fn outstanding(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop every pending handle; their owners observe `ConnectionClosed`
    pub fn fail_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if let Ok(mut ids) = self.ids.lock() {
            ids.clear();
        }
    }
}
