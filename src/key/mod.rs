//! Data encryption keys and the epochs they are used in

pub mod cache;
pub mod unwrap_cache;

use crate::crypto::{fill_random, NonceGenerator, GCM_NONCE_SIZE};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a DEK in bytes (AES-256)
pub const DEK_SIZE: usize = 32;

/// A plaintext data encryption key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; DEK_SIZE],
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey").field("bytes", &"<hidden>").finish()
    }
}

impl DataKey {
    /// Generates a new random DEK
    pub fn generate() -> Self {
        let mut bytes = [0_u8; DEK_SIZE];
        fill_random(&mut bytes);
        Self { bytes }
    }

    /// Builds a DEK from unwrapped key material, wiping the source buffer
    pub fn from_vec(mut material: Vec<u8>) -> Result<Self> {
        if material.len() != DEK_SIZE {
            let len = material.len();
            material.zeroize();
            return Err(Error::Internal(format!(
                "unwrapped DEK has {} bytes, expected {}",
                len, DEK_SIZE
            )));
        }

        let mut bytes = [0_u8; DEK_SIZE];
        bytes.copy_from_slice(&material);
        material.zeroize();
        Ok(Self { bytes })
    }

    /// Returns the key material
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One (keyID, DEK) pairing and its validity window.
///
/// Epochs are immutable: a refresh or a validity extension produces a new value. The nonce
/// counter belongs to the DEK, so every copy of an epoch (and every transformer holding one)
/// draws from the same sequence.
#[derive(Debug, Clone)]
pub struct KeyEpoch {
    key_id: String,
    dek: Arc<DataKey>,
    nonces: Arc<NonceGenerator>,
    encrypted_dek: Vec<u8>,
    annotations: BTreeMap<String, Vec<u8>>,
    expires_at: DateTime<Utc>,
}

impl KeyEpoch {
    /// Creates a new epoch
    pub fn new(
        key_id: String,
        dek: DataKey,
        encrypted_dek: Vec<u8>,
        annotations: BTreeMap<String, Vec<u8>>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key_id,
            dek: Arc::new(dek),
            nonces: Arc::new(NonceGenerator::new()),
            encrypted_dek,
            annotations,
            expires_at,
        }
    }

    /// ID of the KEK that wrapped this epoch's DEK
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The plaintext DEK
    pub fn dek(&self) -> &DataKey {
        &self.dek
    }

    /// A shared handle to the plaintext DEK
    pub fn shared_dek(&self) -> Arc<DataKey> {
        self.dek.clone()
    }

    /// Next nonce for a value sealed under this epoch's DEK
    pub fn next_nonce(&self) -> Result<[u8; GCM_NONCE_SIZE]> {
        self.nonces.next()
    }

    /// The DEK as wrapped by the KMS
    pub fn encrypted_dek(&self) -> &[u8] {
        &self.encrypted_dek
    }

    /// Annotations the KMS returned when wrapping the DEK
    pub fn annotations(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.annotations
    }

    /// End of the validity window for new encryptions
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true once `now` has reached the end of the validity window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns a copy of this epoch valid until `expires_at`
    pub(crate) fn renewed(&self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            ..self.clone()
        }
    }
}
