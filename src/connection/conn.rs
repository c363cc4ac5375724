//! The connection state machine and its loop task.
//!
//! A [`Connection`] owns exactly one duplex byte stream. One dedicated loop
//! task per connection advances the state machine, drains the outbound
//! queues, frames/encrypts/writes, then non-blockingly reads, decrypts,
//! unframes, and dispatches every inbound bulk to the sub-protocol matching
//! its `(direction, kind)`. Suspension is a fixed tick interval; the loop
//! never blocks on a read.
//!
//! Frames are written and processed one at a time so that a renegotiation
//! (cryption swap, length-width change) takes effect at an exact frame
//! boundary: the side answering a negotiation applies the change right
//! after its reply frame is written, the requesting side applies it while
//! processing that reply. Frames before the boundary use the old
//! parameters, frames after it the new ones, on both sides.
//!
//! Heartbeats: while `Open`, an `alive` control bulk is queued every
//! `timeout` interval, and a connection that has received no control
//! traffic for `timeout + 2s` closes itself.

use bytes::BytesMut;
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::state::{ConnectionState, StateCell};
use crate::config::ConnectionConfig;
use crate::core::{Bulk, Direction, FrameCodec, Kind};
use crate::crypto::{CryptionState, CryptionVariant};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::{
    AfterSend, CommunicationProtocol, ConnectionHandlers, ControlProtocol, DataProtocol,
    EnqueueFn, Negotiation, PendingReply, ProtocolSet, RequestCache, SubscriptionProtocol,
};
use crate::utils::{Metrics, WorkerPool};

/// Extra slack past the lease deadline before the loop gives up on a peer
const LEASE_GRACE: Duration = Duration::from_secs(2);

/// Headroom reserved for cryption expansion (nonce + tag) when checking a
/// bulk against the frame limit at enqueue time
const CRYPTION_OVERHEAD: usize = 64;

/// An outbound frame plus the parameter changes that take effect once it
/// is on the wire
struct OutFrame {
    bulk: Bulk,
    after: Vec<AfterSend>,
}

impl OutFrame {
    fn plain(bulk: Bulk) -> Self {
        Self {
            bulk,
            after: Vec::new(),
        }
    }
}

/// Outbound queues, shared between the owner task and the loop task
#[derive(Default)]
struct OutboundQueues {
    /// Data and subscription traffic; drained only while `Open`
    data: Mutex<VecDeque<Bulk>>,
    /// Control replies and heartbeats; drained in every live state
    control: Mutex<VecDeque<Bulk>>,
    /// Communication replies with their deferred effects
    responses: Mutex<VecDeque<OutFrame>>,
    /// Negotiations the owner wants to run
    negotiations: Mutex<VecDeque<Negotiation>>,
}

impl OutboundQueues {
    fn push_data(&self, bulk: Bulk) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bulk);
    }

    fn drain_data(&self) -> Vec<Bulk> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn push_control(&self, bulk: Bulk) {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bulk);
    }

    fn drain_control(&self) -> Vec<Bulk> {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn push_response(&self, bulk: Bulk, after: Vec<AfterSend>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(OutFrame { bulk, after });
    }

    fn drain_responses(&self) -> Vec<OutFrame> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn push_negotiation(&self, negotiation: Negotiation) {
        self.negotiations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(negotiation);
    }

    fn pop_negotiation(&self) -> Option<Negotiation> {
        self.negotiations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn has_negotiations(&self) -> bool {
        !self
            .negotiations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

struct Shared {
    config: ConnectionConfig,
    state: StateCell,
    queues: OutboundQueues,
    data: Arc<DataProtocol>,
    subscription: Arc<SubscriptionProtocol>,
    control: Arc<ControlProtocol>,
    handlers: Arc<dyn ConnectionHandlers>,
    workers: WorkerPool,
    metrics: Arc<Metrics>,
    /// Mirror of the loop's encode width, for the enqueue-time size check
    send_width: AtomicUsize,
    peer: SocketAddr,
}

/// One logical connection over one socket.
///
/// Cheap to clone; every clone addresses the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Wrap an already connected/accepted socket.
    ///
    /// Spawns the loop task; the connection is live when this returns.
    pub fn new(
        stream: TcpStream,
        handlers: Arc<dyn ConnectionHandlers>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        Self::with_parts(stream, handlers, config, None, Arc::new(Metrics::new()))
    }

    /// Wrap a socket with an explicit cache and metrics collector
    pub fn with_parts(
        stream: TcpStream,
        handlers: Arc<dyn ConnectionHandlers>,
        config: ConnectionConfig,
        cache: Option<Arc<dyn RequestCache>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let peer = stream.peer_addr()?;
        let workers = WorkerPool::new(config.workers);
        let ProtocolSet {
            data,
            subscription,
            communication,
            control,
        } = ProtocolSet::new(&config, cache, metrics.clone())?;

        let send_width = AtomicUsize::new(config.max_bytes);
        let shared = Arc::new(Shared {
            config,
            state: StateCell::new(),
            queues: OutboundQueues::default(),
            data,
            subscription,
            control,
            handlers,
            workers,
            metrics: metrics.clone(),
            send_width,
            peer,
        });

        metrics.connection_established();
        info!(peer = %peer, "connection established");

        let driver = Driver::new(shared.clone(), stream, communication)?;
        tokio::spawn(driver.run());

        Ok(Self { shared })
    }

    /// Connect to a peer and wrap the resulting socket
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        handlers: Arc<dyn ConnectionHandlers>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, handlers, config)
    }

    /// Queue a data/subscription bulk for sending.
    ///
    /// # Errors
    /// `SendWhileNotOpen` when the connection is paused, mid-negotiation,
    /// or closed; `Oversize` when the serialized bulk cannot fit a frame at
    /// the current length-header width.
    pub fn send(&self, bulk: Bulk) -> Result<()> {
        let state = self.shared.state.get();
        if state != ConnectionState::Open {
            return Err(ProtocolError::SendWhileNotOpen(state));
        }

        let size = bulk.to_wire()?.len() + CRYPTION_OVERHEAD;
        let limit = FrameCodec::max_payload(self.shared.send_width.load(Ordering::Relaxed));
        if size as u128 >= limit {
            return Err(ProtocolError::Oversize { size, limit });
        }

        self.shared.queues.push_data(bulk);
        Ok(())
    }

    /// Issue a correlated data request.
    ///
    /// Resolves from the cache without touching the wire when possible;
    /// otherwise the returned handle resolves when the peer answers.
    pub fn issue_request(&self, payload: Value) -> Result<PendingReply> {
        let (bulk, reply) = self.shared.data.issue_request(payload)?;
        if let Some(bulk) = bulk {
            let id = bulk.data.first().map(|m| m.id);
            if let Err(e) = self.send(bulk) {
                if let Some(id) = id {
                    self.shared.data.abort_request(id);
                }
                return Err(e);
            }
        }
        Ok(reply)
    }

    /// Ask the peer to deliver notifications matching `shape`
    pub fn subscribe(&self, shape: Value) -> Result<()> {
        let bulk = self.shared.subscription.request_add(shape)?;
        self.send(bulk)
    }

    /// Ask the peer to stop notifications matching `shape`
    pub fn unsubscribe(&self, shape: Value) -> Result<()> {
        let bulk = self.shared.subscription.request_remove(shape)?;
        self.send(bulk)
    }

    /// Push an unsolicited notification to the peer
    pub fn notify(&self, shape: Value, value: Value) -> Result<()> {
        let bulk = self.shared.subscription.notify(shape, value)?;
        self.send(bulk)
    }

    /// Probe the peer's liveness; its answer refreshes our lease like any
    /// other control traffic
    pub fn ping(&self) -> Result<()> {
        let state = self.shared.state.get();
        if state == ConnectionState::Closed {
            return Err(ProtocolError::SendWhileNotOpen(state));
        }
        let bulk = self.shared.control.request_ping()?;
        self.shared.queues.push_control(bulk);
        self.shared.metrics.heartbeat_sent();
        Ok(())
    }

    /// Queue a key rotation under the active cryption variant
    pub fn send_key_exchange(&self) {
        self.shared
            .queues
            .push_negotiation(Negotiation::KeyExchange);
    }

    /// Queue a switch to another cryption variant
    pub fn send_cryption_change(&self, variant: CryptionVariant) {
        self.shared
            .queues
            .push_negotiation(Negotiation::CryptionChange(variant));
    }

    /// Queue a frame length-header width change
    pub fn request_max_bytes(&self, width: usize) -> Result<()> {
        if !(1..=8).contains(&width) {
            return Err(ProtocolError::ConfigError(
                constants::ERR_INVALID_WIDTH.into(),
            ));
        }
        self.shared
            .queues
            .push_negotiation(Negotiation::MaxBytes(width));
        Ok(())
    }

    /// Close the connection: terminal, idempotent.
    ///
    /// Pending replies resolve with `ConnectionClosed`; queued callback
    /// work that has not started is discarded; the loop task notices the
    /// transition and closes the socket.
    pub fn close(&self) {
        if self.shared.state.set(ConnectionState::Closed) {
            info!(peer = %self.shared.peer, "connection closing");
            self.shared.data.fail_all();
            self.shared.workers.shutdown();
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Whether the connection has reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Subscribe to lifecycle transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection reaches `state`
    pub async fn join_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Peer address of the underlying socket
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Metrics collector observing this connection
    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }
}

/// Loop-task state: the socket and everything only the loop touches
struct Driver {
    shared: Arc<Shared>,
    stream: TcpStream,
    codec: FrameCodec,
    cryption: CryptionState,
    communication: CommunicationProtocol,
    lease: Instant,
    next_heartbeat: Instant,
    read_buf: BytesMut,
    enqueue: EnqueueFn,
    eof: bool,
}

impl Driver {
    fn new(
        shared: Arc<Shared>,
        stream: TcpStream,
        communication: CommunicationProtocol,
    ) -> Result<Self> {
        let codec = FrameCodec::new(shared.config.max_bytes)?;
        let timeout = shared.config.timeout();
        let enqueue: EnqueueFn = {
            let shared = shared.clone();
            Arc::new(move |bulk| shared.queues.push_data(bulk))
        };

        Ok(Self {
            shared,
            stream,
            codec,
            cryption: CryptionState::new(),
            communication,
            lease: Instant::now() + timeout,
            next_heartbeat: Instant::now(),
            read_buf: BytesMut::new(),
            enqueue,
            eof: false,
        })
    }

    #[instrument(skip(self), fields(peer = %self.shared.peer))]
    async fn run(mut self) {
        let mut tick = interval(self.shared.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_rx = self.shared.state.subscribe();

        let reason = loop {
            tokio::select! {
                _ = tick.tick() => {}
                res = state_rx.wait_for(|s| *s == ConnectionState::Closed) => {
                    let _ = res;
                    break Ok(());
                }
            }

            if self.shared.state.get() == ConnectionState::Closed {
                break Ok(());
            }
            if let Err(e) = self.tick().await {
                break Err(e);
            }
            if self.eof {
                break Err(ProtocolError::ConnectionClosed);
            }
        };

        match &reason {
            Ok(()) => debug!("connection loop finished"),
            Err(ProtocolError::ConnectionClosed) => info!("peer closed the connection"),
            Err(ProtocolError::Timeout) => {
                warn!(error = constants::ERR_LEASE_EXPIRED, "closing connection")
            }
            Err(e) => warn!(error = %e, "closing connection on failure"),
        }

        self.shared.state.set(ConnectionState::Closed);
        self.shared.data.fail_all();
        self.shared.workers.shutdown();
        self.shared.metrics.connection_closed();
        info!("connection closed");
        // Dropping the driver drops the stream, closing the socket.
    }

    /// One pass of the loop: heartbeat/lease bookkeeping, outbound batch,
    /// write, non-blocking read, inbound dispatch.
    async fn tick(&mut self) -> Result<()> {
        if self.shared.state.get() == ConnectionState::Open {
            let now = Instant::now();
            if now >= self.next_heartbeat {
                self.shared
                    .queues
                    .push_control(self.shared.control.request_alive());
                self.shared.metrics.heartbeat_sent();
                self.next_heartbeat = now + self.shared.config.timeout();
            }
            if now > self.lease + LEASE_GRACE {
                self.shared.metrics.lease_expired();
                return Err(ProtocolError::Timeout);
            }
        }

        let batch = self.collect_batch()?;
        for frame in batch {
            self.write_frame(frame).await?;
        }

        self.fill_read_buffer()?;
        self.process_frames().await
    }

    /// Outbound batch for the current state, advancing the pause handshake
    fn collect_batch(&mut self) -> Result<Vec<OutFrame>> {
        let mut batch: Vec<OutFrame> = Vec::new();

        // A queued negotiation opens the pause window.
        if self.shared.state.get() == ConnectionState::Open && self.shared.queues.has_negotiations()
        {
            self.shared.state.set(ConnectionState::Waiting);
            batch.push(OutFrame::plain(self.communication.request_pause()?));
        }

        // Negotiations all settled: close the window.
        if self.shared.state.get() == ConnectionState::Prewait
            && !self.shared.queues.has_negotiations()
        {
            self.shared.state.set(ConnectionState::Afterwait);
            batch.push(OutFrame::plain(self.communication.request_resume()?));
        }

        // The window is open: run the next queued negotiation.
        if self.shared.state.get() == ConnectionState::Prewait {
            if let Some(negotiation) = self.shared.queues.pop_negotiation() {
                let frame = match negotiation {
                    Negotiation::KeyExchange => OutFrame::plain(
                        self.communication.request_key_exchange(&mut self.cryption)?,
                    ),
                    Negotiation::CryptionChange(variant) => OutFrame::plain(
                        self.communication
                            .request_cryption(variant, &mut self.cryption)?,
                    ),
                    Negotiation::MaxBytes(width) => OutFrame {
                        bulk: self.communication.request_max_bytes(width)?,
                        after: vec![AfterSend::SetSendWidth(width)],
                    },
                };
                batch.push(frame);
                self.shared.state.set(ConnectionState::Waiting);
            }
        }

        // Communication replies and control traffic flow in every live
        // state; data and subscription traffic only while open.
        batch.extend(self.shared.queues.drain_responses());
        batch.extend(
            self.shared
                .queues
                .drain_control()
                .into_iter()
                .map(OutFrame::plain),
        );
        if self.shared.state.get() == ConnectionState::Open {
            batch.extend(
                self.shared
                    .queues
                    .drain_data()
                    .into_iter()
                    .map(OutFrame::plain),
            );
        }

        Ok(batch)
    }

    /// Serialize, encrypt, frame, and write one bulk, then apply its
    /// deferred parameter changes.
    async fn write_frame(&mut self, frame: OutFrame) -> Result<()> {
        let wire = frame.bulk.to_wire()?;
        let sealed = self.cryption.active().encrypt(&wire)?;

        let mut out = BytesMut::new();
        match self.codec.encode_frame(&sealed, &mut out) {
            Ok(()) => {
                self.stream.write_all(&out).await?;
                self.shared.metrics.bulk_sent(out.len() as u64);
            }
            Err(e @ ProtocolError::Oversize { .. }) => {
                // The enqueue-time check guards the public path; anything
                // slipping through here is dropped loudly, not fatally.
                error!(error = %e, kind = ?frame.bulk.kind, "dropping oversize outbound bulk");
            }
            Err(e) => return Err(e),
        }

        for effect in frame.after {
            match effect {
                AfterSend::CommitCryption => self.cryption.commit(),
                AfterSend::SetSendWidth(width) => {
                    self.codec.set_send_width(width)?;
                    self.shared.send_width.store(width, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Drain everything currently readable without blocking
    fn fill_read_buffer(&mut self) -> Result<()> {
        loop {
            self.read_buf.reserve(self.shared.config.packet_size);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decode, decrypt, and dispatch buffered frames one at a time, so a
    /// parameter change carried by frame N applies before frame N+1 is
    /// decoded.
    async fn process_frames(&mut self) -> Result<()> {
        while let Some(frame) = self.codec.decode_frame(&mut self.read_buf)? {
            let plain = self.cryption.active().decrypt(&frame)?;
            let bulk = Bulk::from_wire(&plain)?;
            self.shared
                .metrics
                .bulk_received((frame.len() + self.codec.recv_width()) as u64);
            self.dispatch(bulk).await?;
        }
        Ok(())
    }

    /// Route one inbound bulk to its sub-protocol
    async fn dispatch(&mut self, bulk: Bulk) -> Result<()> {
        match (bulk.direction, bulk.kind) {
            (Direction::Request, Kind::Data) => {
                self.shared
                    .data
                    .process_request(
                        bulk,
                        self.shared.handlers.clone(),
                        &self.shared.workers,
                        self.enqueue.clone(),
                    )
                    .await?;
            }
            (Direction::Response, Kind::Data) => {
                self.shared
                    .data
                    .process_response(bulk, self.shared.handlers.clone(), &self.shared.workers)
                    .await?;
            }
            (Direction::Request, Kind::Subscription) => {
                if let Some(ack) = self
                    .shared
                    .subscription
                    .process_request(&bulk, self.shared.handlers.as_ref())
                {
                    self.shared.queues.push_data(ack);
                }
            }
            (Direction::Response, Kind::Subscription) => {
                self.shared
                    .subscription
                    .process_response(&bulk, self.shared.handlers.as_ref());
            }
            (Direction::Request, Kind::Communication) => {
                let processed = self
                    .communication
                    .process_request(&bulk, &mut self.cryption)?;

                if processed.pause {
                    if self.shared.state.get() == ConnectionState::Open {
                        self.shared.state.set(ConnectionState::Paused);
                    } else {
                        warn!("pause request outside open state; acknowledging only");
                    }
                }
                if processed.resume && self.shared.state.get() == ConnectionState::Paused {
                    self.shared.state.set(ConnectionState::Open);
                    self.refresh_lease();
                }
                if let Some(width) = processed.set_recv_width {
                    self.codec.set_recv_width(width)?;
                }
                if let Some(reply) = processed.reply {
                    self.shared.queues.push_response(reply, processed.after_send);
                }
            }
            (Direction::Response, Kind::Communication) => {
                let settled = self
                    .communication
                    .process_response(&bulk, &mut self.cryption)?;
                if let Some(width) = settled.set_recv_width {
                    self.codec.set_recv_width(width)?;
                }
                if settled.satisfied {
                    match self.shared.state.get() {
                        ConnectionState::Waiting => {
                            self.shared.state.set(ConnectionState::Prewait);
                        }
                        ConnectionState::Afterwait => {
                            self.shared.state.set(ConnectionState::Open);
                            self.refresh_lease();
                        }
                        other => {
                            warn!(state = ?other, "negotiation response outside window");
                        }
                    }
                }
            }
            (Direction::Request, Kind::Control) => {
                self.refresh_lease();
                self.shared.metrics.heartbeat_received();
                if let Some(reply) = self.shared.control.process_request(&bulk) {
                    self.shared.queues.push_control(reply);
                }
            }
            (Direction::Response, Kind::Control) => {
                self.refresh_lease();
                self.shared.metrics.heartbeat_received();
                self.shared.control.process_response(&bulk);
            }
        }
        Ok(())
    }

    fn refresh_lease(&mut self) {
        self.lease = Instant::now() + self.shared.config.timeout();
    }
}
