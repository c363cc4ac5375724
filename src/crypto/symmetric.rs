//! Shared-key XChaCha20-Poly1305 cryption.
//!
//! `new_key` generates a random 32-byte key, installs it locally, and
//! returns it base64-encoded for the peer; `set_key` installs key material
//! received the same way. Each encrypted buffer is laid out as
//! `nonce(24) || ciphertext`, with a fresh random nonce per buffer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::RngCore;
use zeroize::Zeroize;

use super::{Cryption, CryptionVariant};
use crate::error::{constants, ProtocolError, Result};

/// Byte length of the per-buffer nonce prefix
pub(super) const NONCE_LEN: usize = 24;

/// Byte length of the shared key
pub(super) const KEY_LEN: usize = 32;

/// Encrypt one buffer as `nonce || ciphertext` with a fresh random nonce
pub(super) fn seal(cipher: &XChaCha20Poly1305, plain: &[u8]) -> Result<Vec<u8>> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_ENCRYPTION_FAILED.into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`seal`]
pub(super) fn open(cipher: &XChaCha20Poly1305, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(ProtocolError::CryptoFailure(
            constants::ERR_DECRYPTION_FAILED.into(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_DECRYPTION_FAILED.into()))
}

/// XChaCha20-Poly1305 under one shared key
#[derive(Default)]
pub struct SymmetricCryption {
    cipher: Option<XChaCha20Poly1305>,
}

impl SymmetricCryption {
    /// Unkeyed instance; `new_key` or `set_key` must run before any
    /// transform
    pub fn new() -> Self {
        Self { cipher: None }
    }

    fn install(&mut self, key: &[u8; KEY_LEN]) {
        self.cipher = Some(XChaCha20Poly1305::new(key.into()));
    }
}

impl Cryption for SymmetricCryption {
    fn variant(&self) -> CryptionVariant {
        CryptionVariant::Symmetric
    }

    fn new_key(&mut self) -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        self.install(&key);
        let encoded = BASE64.encode(key);
        key.zeroize();
        encoded
    }

    fn set_key(&mut self, key: &str) -> Result<()> {
        let decoded = BASE64
            .decode(key)
            .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_BAD_KEY_MATERIAL.into()))?;
        let mut bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| ProtocolError::CryptoFailure(constants::ERR_BAD_KEY_MATERIAL.into()))?;
        self.install(&bytes);
        bytes.zeroize();
        Ok(())
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| ProtocolError::CryptoFailure(constants::ERR_KEY_NOT_SET.into()))?;
        seal(cipher, plain)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| ProtocolError::CryptoFailure(constants::ERR_KEY_NOT_SET.into()))?;
        open(cipher, data)
    }
}
