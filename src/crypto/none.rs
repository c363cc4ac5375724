//! Identity transform, the default for a freshly opened connection.

use super::{Cryption, CryptionVariant};
use crate::error::Result;

/// Pass-through cryption: no key material, byte buffers unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCryption;

impl Cryption for NoCryption {
    fn variant(&self) -> CryptionVariant {
        CryptionVariant::None
    }

    fn new_key(&mut self) -> String {
        String::new()
    }

    fn set_key(&mut self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        Ok(cipher.to_vec())
    }
}
