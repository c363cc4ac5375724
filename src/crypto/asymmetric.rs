//! X25519 key agreement with an XChaCha20-Poly1305 transport transform.
//!
//! `new_key` generates a fresh local keypair and returns the public half;
//! `set_key` installs the peer's public key. As soon as both halves are
//! present the shared secret is hashed into a session key, so the two calls
//! may arrive in either order: the requester of a cryption change calls
//! `new_key` before it has the peer's share, the responder calls `set_key`
//! first.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use super::symmetric::KEY_LEN;
use super::{Cryption, CryptionVariant};
use crate::error::{constants, ProtocolError, Result};

/// X25519 agreement deriving a symmetric session transform
#[derive(Default)]
pub struct AsymmetricCryption {
    secret: Option<StaticSecret>,
    peer_public: Option<PublicKey>,
    cipher: Option<XChaCha20Poly1305>,
}

impl AsymmetricCryption {
    /// Instance with no key material on either side
    pub fn new() -> Self {
        Self {
            secret: None,
            peer_public: None,
            cipher: None,
        }
    }

    /// Derive the session cipher once both key halves are present
    fn derive(&mut self) {
        if let (Some(secret), Some(peer)) = (&self.secret, &self.peer_public) {
            let shared = secret.diffie_hellman(peer);

            let mut hasher = Sha256::new();
            hasher.update(b"session-key");
            hasher.update(shared.as_bytes());
            let key: [u8; KEY_LEN] = hasher.finalize().into();

            self.cipher = Some(XChaCha20Poly1305::new(&key.into()));
        }
    }

    fn transport(&self) -> Result<&XChaCha20Poly1305> {
        self.cipher
            .as_ref()
            .ok_or_else(|| ProtocolError::CryptoFailure(constants::ERR_KEY_NOT_SET.into()))
    }
}

impl Cryption for AsymmetricCryption {
    fn variant(&self) -> CryptionVariant {
        CryptionVariant::Asymmetric
    }

    fn new_key(&mut self) -> String {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.secret = Some(secret);
        self.derive();
        BASE64.encode(public.as_bytes())
    }

    fn set_key(&mut self, key: &str) -> Result<()> {
        let decoded = BASE64
            .decode(key)
            .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_BAD_KEY_MATERIAL.into()))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_BAD_KEY_MATERIAL.into()))?;

        self.peer_public = Some(PublicKey::from(bytes));
        self.derive();
        Ok(())
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        super::symmetric::seal(self.transport()?, plain)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        super::symmetric::open(self.transport()?, data)
    }
}
