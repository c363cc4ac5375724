//! # Cryption Service
//!
//! Pluggable symmetric encryption for the wire stream.
//!
//! Three variants are negotiable at runtime:
//! - **none**: identity transform, the default for a fresh connection
//! - **symmetric**: XChaCha20-Poly1305 under a shared random key
//! - **asymmetric**: X25519 key agreement deriving an XChaCha20-Poly1305
//!   session key
//!
//! Key material travels as base64 text inside communication messages.
//! Renegotiation is two-phase: the replacement transform is staged in a
//! [`CryptionState`] while the handshake round is in flight, and committed
//! exactly once, after the local side writes its half of the round, so
//! each frame on the wire is decryptable with the transform its receiver
//! holds at that moment.
//!
//! Cryption state is owned per connection; there are no process-wide
//! singletons.

mod asymmetric;
mod none;
mod symmetric;

pub use asymmetric::AsymmetricCryption;
pub use none::NoCryption;
pub use symmetric::SymmetricCryption;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The encryption algorithm family in force on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CryptionVariant {
    /// Identity transform
    #[default]
    None,
    /// X25519 agreement, XChaCha20-Poly1305 transport
    Asymmetric,
    /// Shared-key XChaCha20-Poly1305
    Symmetric,
}

/// Capability set every cryption variant implements.
///
/// `new_key` never fails; `encrypt`/`decrypt` are pure byte-buffer
/// transforms over the current key material.
pub trait Cryption: Send {
    /// Which variant this instance implements
    fn variant(&self) -> CryptionVariant;

    /// Generate fresh local key material, install it, and return the share
    /// that must travel to the peer (base64)
    fn new_key(&mut self) -> String;

    /// Install key material received from the peer (base64)
    fn set_key(&mut self, key: &str) -> Result<()>;

    /// Transform a plaintext buffer for the wire
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Reverse [`Cryption::encrypt`]
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// Factory for cryption instances
pub struct CryptionService;

impl CryptionService {
    /// Construct a fresh, unkeyed instance of the given variant
    pub fn create(variant: CryptionVariant) -> Box<dyn Cryption> {
        match variant {
            CryptionVariant::None => Box::new(NoCryption),
            CryptionVariant::Symmetric => Box::new(SymmetricCryption::new()),
            CryptionVariant::Asymmetric => Box::new(AsymmetricCryption::new()),
        }
    }

    /// The transform a freshly opened connection starts with
    pub fn initial() -> Box<dyn Cryption> {
        Box::new(NoCryption)
    }
}

/// Active transform plus the staged replacement during renegotiation
pub struct CryptionState {
    active: Box<dyn Cryption>,
    pending: Option<Box<dyn Cryption>>,
}

impl CryptionState {
    /// Fresh connection state: `none` active, nothing staged
    pub fn new() -> Self {
        Self {
            active: CryptionService::initial(),
            pending: None,
        }
    }

    /// The transform currently applied to the wire
    pub fn active(&self) -> &dyn Cryption {
        self.active.as_ref()
    }

    /// Stage a replacement transform without activating it
    pub fn stage(&mut self, cryption: Box<dyn Cryption>) {
        self.pending = Some(cryption);
    }

    /// Stage a fresh unkeyed instance of the active variant (key rotation)
    pub fn stage_rotation(&mut self) -> &mut Box<dyn Cryption> {
        self.pending
            .insert(CryptionService::create(self.active.variant()))
    }

    /// The staged transform, if a renegotiation round is in flight
    pub fn pending_mut(&mut self) -> Option<&mut Box<dyn Cryption>> {
        self.pending.as_mut()
    }

    /// Whether a renegotiation round is in flight
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Swap the staged transform in as the active one.
    ///
    /// No-op when nothing is staged; a second commit of the same round is
    /// therefore harmless.
    pub fn commit(&mut self) {
        if let Some(next) = self.pending.take() {
            self.active = next;
        }
    }

    /// Drop a staged transform without activating it
    pub fn abandon(&mut self) {
        self.pending = None;
    }
}

impl Default for CryptionState {
    fn default() -> Self {
        Self::new()
    }
}
