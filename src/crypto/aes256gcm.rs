use crate::crypto::aead::{fill_random, GCM_MAX_DATA_SIZE, GCM_NONCE_SIZE, GCM_TAG_SIZE};
use crate::error::{Error, Result};
use crate::Aead;
use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// AES-256-GCM implementation of AEAD
///
/// Ciphertexts are laid out as `nonce(12) || sealed payload`, where the sealed payload
/// carries the 16 byte tag at its end.
#[derive(Default, Debug, Clone)]
pub struct Aes256GcmAead;

impl Aes256GcmAead {
    /// Creates a new instance of the AES-256-GCM AEAD implementation
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Internal(format!("invalid AES-256 key length: {}", key.len())))
    }

    /// Seals `plaintext` under `key` with the given nonce, binding `aad` into the tag
    pub fn seal_value(
        &self,
        key: &[u8],
        nonce: &[u8; GCM_NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if plaintext.len() > GCM_MAX_DATA_SIZE {
            return Err(Error::Internal("data too large for GCM".into()));
        }

        let cipher = Self::cipher(key)?;
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Internal(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens a ciphertext produced by [`seal_value`](Self::seal_value)
    pub fn open_value(&self, key: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < GCM_NONCE_SIZE + GCM_TAG_SIZE {
            // Must have at least nonce and tag
            return Err(Error::DecryptionFailed(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let cipher = Self::cipher(key)?;
        let (nonce, sealed) = ciphertext.split_at(GCM_NONCE_SIZE);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload { msg: sealed, aad },
            )
            .map_err(|_| Error::DecryptionFailed("message authentication failed".into()))
    }
}

impl Aead for Aes256GcmAead {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0_u8; GCM_NONCE_SIZE];
        fill_random(&mut nonce);
        self.seal_value(key, &nonce, data, &[])
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        self.open_value(key, data, &[])
    }
}
