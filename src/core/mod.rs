//! # Core Protocol Components
//!
//! Low-level wire model and framing.
//!
//! This module provides the foundation for the protocol: the bulk/message
//! envelope and the length-prefixed frame codec.
//!
//! ## Components
//! - **Envelope**: `Bulk` / `Message` wire model with closed direction and
//!   kind enums
//! - **Codec**: length-prefixed framing with renegotiable header width
//!
//! ## Wire Format
//! ```text
//! [Length(max_bytes, big-endian)] [Ciphertext(N)]
//! ```
//!
//! The ciphertext is the active cryption transform applied to the
//! JSON-serialized bulk; with the default `none` transform it is the
//! serialized bulk itself.

pub mod codec;
pub mod envelope;

pub use codec::FrameCodec;
pub use envelope::{Bulk, Direction, Kind, Message, UNSOLICITED_ID};
