//! Listening socket and connection fan-out.
//!
//! A [`Listener`] binds a port, accepts sockets in a loop, and wraps each
//! one in a [`Connection`] sharing the listener's handlers, cache, and
//! metrics. Accepted connections are tracked so that
//! [`Listener::provide_data`] can fan a subscription notification out to
//! every attached peer whose recorded subscriptions match.
//!
//! Shutdown mirrors the accept loop's select: a message on the shutdown
//! channel stops accepting and closes every tracked connection.

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::conn::Connection;
use crate::config::ListenerConfig;
use crate::error::Result;
use crate::protocol::{ConnectionHandlers, RequestCache};
use crate::utils::Metrics;

/// Shapes one peer has subscribed to, recorded on the listener side
#[derive(Default)]
struct SubscriptionRegistry {
    shapes: Mutex<Vec<Value>>,
}

impl SubscriptionRegistry {
    fn add(&self, shape: &Value) {
        let mut shapes = self.shapes.lock().unwrap_or_else(PoisonError::into_inner);
        if !shapes.contains(shape) {
            shapes.push(shape.clone());
        }
    }

    fn remove(&self, shape: &Value) {
        self.shapes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s != shape);
    }

    fn matches(&self, shape: &Value) -> bool {
        self.shapes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(shape)
    }
}

/// Wraps the owner's handlers to keep the per-connection subscription
/// registry current before delegating.
struct RegistryHandlers {
    inner: Arc<dyn ConnectionHandlers>,
    registry: Arc<SubscriptionRegistry>,
}

impl ConnectionHandlers for RegistryHandlers {
    fn handle_request(&self, request: Value) -> Value {
        self.inner.handle_request(request)
    }

    fn rework_response(&self, response: Value) -> Value {
        self.inner.rework_response(response)
    }

    fn subscription_added(&self, shape: &Value) {
        self.registry.add(shape);
        self.inner.subscription_added(shape);
    }

    fn subscription_removed(&self, shape: &Value) {
        self.registry.remove(shape);
        self.inner.subscription_removed(shape);
    }

    fn notification(&self, shape: &Value, value: &Value) {
        self.inner.notification(shape, value);
    }
}

type Attached = Arc<Mutex<Vec<(Connection, Arc<SubscriptionRegistry>)>>>;

/// Accepting side of the protocol: one [`Connection`] per accepted socket
pub struct Listener {
    local_addr: SocketAddr,
    attached: Attached,
    shutdown_tx: mpsc::Sender<()>,
    metrics: Arc<Metrics>,
}

impl Listener {
    /// Bind and start accepting.
    ///
    /// Every accepted socket becomes a connection configured per
    /// `config.connection`, sharing `handlers` and the listener's metrics.
    pub async fn bind(config: ListenerConfig, handlers: Arc<dyn ConnectionHandlers>) -> Result<Self> {
        Self::bind_with_cache(config, handlers, None).await
    }

    /// Bind with a request cache shared by every accepted connection
    #[instrument(skip(config, handlers, cache), fields(port = config.port))]
    pub async fn bind_with_cache(
        config: ListenerConfig,
        handlers: Arc<dyn ConnectionHandlers>,
        cache: Option<Arc<dyn RequestCache>>,
    ) -> Result<Self> {
        config.validate_strict()?;

        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "listening");

        let attached: Attached = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(accept_loop(
            listener,
            config,
            handlers,
            cache,
            attached.clone(),
            metrics.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            attached,
            shutdown_tx,
            metrics,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fan a notification out to every attached connection subscribed to
    /// `shape`. Returns how many connections it was queued on.
    pub fn provide_data(&self, shape: &Value, value: &Value) -> usize {
        let mut delivered = 0;
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        attached.retain(|(conn, _)| !conn.is_closed());

        for (conn, registry) in attached.iter() {
            if !registry.matches(shape) {
                continue;
            }
            match conn.notify(shape.clone(), value.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(peer = %conn.peer_addr(), error = %e, "skipping notification");
                }
            }
        }
        delivered
    }

    /// Number of currently attached (non-closed) connections
    pub fn connections(&self) -> usize {
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        attached.retain(|(conn, _)| !conn.is_closed());
        attached.len()
    }

    /// Metrics collector shared by the listener and its connections
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stop accepting and close every attached connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
        let attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        for (conn, _) in attached.iter() {
            conn.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    handlers: Arc<dyn ConnectionHandlers>,
    cache: Option<Arc<dyn RequestCache>>,
    attached: Attached,
    metrics: Arc<Metrics>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("listener shutting down");
                return;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "accepted connection");
                        let registry = Arc::new(SubscriptionRegistry::default());
                        let wrapped: Arc<dyn ConnectionHandlers> = Arc::new(RegistryHandlers {
                            inner: handlers.clone(),
                            registry: registry.clone(),
                        });

                        match Connection::with_parts(
                            stream,
                            wrapped,
                            config.connection.clone(),
                            cache.clone(),
                            metrics.clone(),
                        ) {
                            Ok(conn) => {
                                let mut attached =
                                    attached.lock().unwrap_or_else(PoisonError::into_inner);
                                attached.retain(|(c, _)| !c.is_closed());
                                attached.push((conn, registry));
                            }
                            Err(e) => {
                                warn!(peer = %addr, error = %e, "failed to start connection");
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "error accepting connection");
                    }
                }
            }
        }
    }
}
