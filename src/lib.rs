//! # peer-protocol
//!
//! Multiplexed peer-to-peer connection protocol core.
//!
//! One encrypted, length-framed byte stream carries four independent
//! sub-protocols (control heartbeats, parameter and key negotiation,
//! correlated request/response data exchange, and publish/subscribe
//! notification) with cooperative pause/resume flow control and
//! at-most-one-socket-per-logical-connection semantics.
//!
//! ## Architecture
//! - **core**: the `Bulk`/`Message` wire model and the length-prefixed
//!   frame codec with a renegotiable header width
//! - **crypto**: pluggable cryption service (`none`, `symmetric`,
//!   `asymmetric`) negotiated at runtime, owned per connection
//! - **protocol**: the four sub-protocols, the request correlation table,
//!   and the ring id allocator
//! - **connection**: the six-state connection machine, its loop task, and
//!   the listening acceptor
//! - **config / error / utils**: configuration loading and validation, the
//!   error taxonomy, metrics, timestamps, and the callback worker pool
//!
//! ## Example
//! ```no_run
//! use peer_protocol::config::{ConnectionConfig, ListenerConfig};
//! use peer_protocol::connection::{Connection, Listener};
//! use peer_protocol::protocol::ConnectionHandlers;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl ConnectionHandlers for Echo {
//!     fn handle_request(&self, request: Value) -> Value {
//!         json!({ "echo": request })
//!     }
//! }
//!
//! # async fn run() -> peer_protocol::error::Result<()> {
//! let listener = Listener::bind(ListenerConfig::default(), Arc::new(Echo)).await?;
//!
//! let client = Connection::connect(
//!     ("127.0.0.1", listener.local_addr().port()),
//!     Arc::new(Echo),
//!     ConnectionConfig::default(),
//! )
//! .await?;
//!
//! let reply = client.issue_request(json!({"op": "ping"}))?;
//! let answer = reply.recv().await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod utils;

// Primary surface, re-exported for convenience
pub use crate::config::{ConnectionConfig, ListenerConfig};
pub use crate::connection::{Connection, ConnectionState, Listener};
pub use crate::core::{Bulk, Direction, Kind, Message};
pub use crate::crypto::{Cryption, CryptionService, CryptionVariant};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{ConnectionHandlers, MemoryCache, PendingReply, RequestCache};
