use crate::crypto::Aes256GcmAead;
use crate::error::{Error, Result};
use crate::key::DataKey;
use crate::kms::{DecryptRequest, EncryptResponse, StatusResponse};
use crate::{Aead, KeyManagementService};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A failure mode an [`InMemoryKms`] can be switched into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFailure {
    /// Calls are answered but refused, as with a disabled KEK
    Disabled,
    /// Calls never reach the backend
    Unreachable,
}

#[derive(Debug)]
struct KeyRing {
    current: u64,
    keys: HashMap<String, DataKey>,
}

impl KeyRing {
    fn current_id(&self) -> String {
        self.current.to_string()
    }
}

/// An in-memory key management service for testing
///
/// Master keys are generated on construction and on every [`rotate_key`](Self::rotate_key),
/// with key IDs `"1"`, `"2"`, and so on. Old keys stay available for unwrapping. The service
/// can be put into a failure mode and slowed down to exercise the caching layers above it.
#[derive(Debug)]
pub struct InMemoryKms {
    ring: RwLock<KeyRing>,
    aead: Aes256GcmAead,
    annotations: BTreeMap<String, Vec<u8>>,
    failure: Mutex<Option<BackendFailure>>,
    latency: Mutex<Option<Duration>>,
    encrypt_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl Default for InMemoryKms {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKms {
    /// Creates a new service whose active key ID is `"1"`
    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert("1".to_string(), DataKey::generate());

        Self {
            ring: RwLock::new(KeyRing { current: 1, keys }),
            aead: Aes256GcmAead::new(),
            annotations: BTreeMap::new(),
            failure: Mutex::new(None),
            latency: Mutex::new(None),
            encrypt_calls: AtomicUsize::new(0),
            decrypt_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Attaches annotations to every wrapped DEK
    pub fn with_annotations(mut self, annotations: BTreeMap<String, Vec<u8>>) -> Self {
        self.annotations = annotations;
        self
    }

    /// Switches to a fresh master key and returns its ID
    pub fn rotate_key(&self) -> String {
        let mut ring = self.ring.write();
        ring.current += 1;
        let key_id = ring.current_id();
        ring.keys.insert(key_id.clone(), DataKey::generate());
        key_id
    }

    /// ID of the active master key
    pub fn key_id(&self) -> String {
        self.ring.read().current_id()
    }

    /// Puts the service into `failure`, or back to normal with `None`
    pub fn set_failure(&self, failure: Option<BackendFailure>) {
        *self.failure.lock() = failure;
    }

    /// Delays every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    async fn simulate_backend(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = *self.failure.lock();
        match failure {
            None => Ok(()),
            Some(BackendFailure::Disabled) => Err(Error::Precondition("key disabled".into())),
            Some(BackendFailure::Unreachable) => {
                Err(Error::Unavailable("connection refused".into()))
            },
        }
    }
}

#[async_trait]
impl KeyManagementService for InMemoryKms {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<EncryptResponse> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_backend().await?;

        let ring = self.ring.read();
        let key_id = ring.current_id();
        let master_key = ring
            .keys
            .get(&key_id)
            .ok_or_else(|| Error::Internal(format!("active key {} is missing", key_id)))?;

        Ok(EncryptResponse {
            ciphertext: self.aead.encrypt(plaintext_dek, master_key.as_bytes())?,
            key_id,
            annotations: self.annotations.clone(),
        })
    }

    async fn decrypt_dek(&self, request: &DecryptRequest) -> Result<Vec<u8>> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_backend().await?;

        let ring = self.ring.read();
        let master_key = ring
            .keys
            .get(&request.key_id)
            .ok_or_else(|| Error::NotFound(format!("unknown keyID {:?}", request.key_id)))?;

        self.aead
            .decrypt(&request.ciphertext, master_key.as_bytes())
            .map_err(|_| {
                Error::NotFound(format!(
                    "encrypted DEK was not wrapped by keyID {:?}",
                    request.key_id
                ))
            })
    }

    async fn status(&self) -> Result<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_backend().await?;
        Ok(StatusResponse::healthy(self.key_id()))
    }
}
