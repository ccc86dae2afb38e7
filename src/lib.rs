//! # KMS Envelope Encryption
//!
//! `kmsenvelope` encrypts values before they are written to a key-value store and decrypts them
//! on read. A remote Key Management Service holds the key encryption key (KEK); this crate
//! generates a data encryption key (DEK) locally, has the KMS wrap it, and reuses the DEK for
//! every write of an epoch so that most writes need no remote call.
//!
//! The moving parts:
//!
//! - [`envelope`]: the wire codec (`k8s:enc:kms:v2:<provider>:` + encrypted object) and the
//!   [`EnvelopeTransformer`] that ties everything together
//! - [`crypto`]: AES-256-GCM sealing with location-bound authenticated data and counter nonces
//! - [`key`]: DEKs, key epochs, the single-flight epoch cache and the read-side unwrap cache
//! - [`kms`]: in-memory backend, per-call timeouts and the endpoint-deduplicating registry
//! - [`health`]: the aggregated `kms-providers` health check
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use kmsenvelope::clock::SystemClock;
//! use kmsenvelope::kms::ServiceRegistry;
//! use kmsenvelope::policy::{EnvelopeConfig, ProviderConfig};
//! use kmsenvelope::provider::EncryptionProviders;
//! use kmsenvelope::Transformer;
//! use std::sync::Arc;
//!
//! # async fn example() -> kmsenvelope::Result<()> {
//! let config = EnvelopeConfig::new(vec![ProviderConfig::new("kms-provider", "mem://kms-provider")]);
//! let providers =
//!     EncryptionProviders::from_config(&config, ServiceRegistry::global(), Arc::new(SystemClock)).await?;
//!
//! let location = "/registry/secrets/default/db-password";
//! let stored = providers.chain().transform_to_storage(b"hunter2", location).await?;
//! let (plaintext, stale) = providers.chain().transform_from_storage(&stored, location).await?;
//! assert_eq!(plaintext, b"hunter2");
//! assert!(!stale);
//!
//! let report = providers.health().health_report().await;
//! assert_eq!(report.message(), "ok");
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod health;
pub mod key;
pub mod kms;
pub mod policy;
pub mod provider;

// Plugin architecture for remote KMS backends
pub mod plugins;

// Re-export key types
pub use crate::envelope::chain::ProviderChain;
pub use crate::envelope::transformer::EnvelopeTransformer;
pub use crate::envelope::EncryptedObject;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::health::{HealthAggregator, HealthReport, ProviderHealth};
pub use crate::key::cache::DekCache;
pub use crate::key::{DataKey, KeyEpoch};
pub use crate::kms::{DecryptRequest, EncryptResponse, ServiceRegistry, StatusResponse};
pub use crate::policy::{EnvelopeConfig, ProviderConfig};
pub use crate::provider::{EncryptionProviders, KmsProvider};

use async_trait::async_trait;
use std::fmt;

/// Capability set of one KMS backend.
///
/// Implementations wrap and unwrap DEKs under the backend's current KEK and answer a
/// lightweight liveness probe.
#[async_trait]
pub trait KeyManagementService: Send + Sync + fmt::Debug {
    /// Wraps a DEK under the current KEK
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<EncryptResponse>;

    /// Unwraps a DEK previously returned by [`encrypt_dek`](Self::encrypt_dek)
    async fn decrypt_dek(&self, request: &DecryptRequest) -> Result<Vec<u8>>;

    /// Reports backend health and the currently active key ID
    async fn status(&self) -> Result<StatusResponse>;
}

/// Converts values between their plaintext and their stored form.
///
/// `location` is the storage key of the value; it is bound into the ciphertext, so a stored
/// value only decrypts at the location it was written to.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Encrypts `plaintext` for storage at `location`
    async fn transform_to_storage(&self, plaintext: &[u8], location: &str) -> Result<Vec<u8>>;

    /// Decrypts a stored value.
    ///
    /// The returned flag is true when the value should be rewritten because it was not produced
    /// with the current key.
    async fn transform_from_storage(&self, data: &[u8], location: &str) -> Result<(Vec<u8>, bool)>;
}

/// AEAD (Authenticated Encryption with Associated Data) interface
pub trait Aead: Send + Sync + fmt::Debug {
    /// Encrypts data using the provided key
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts data using the provided key
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}
