//! Key Management Service backends and plumbing
//!
//! This module provides the pieces that sit between a provider and its remote KMS:
//!
//! - The request and response types of the [`KeyManagementService`](crate::KeyManagementService)
//!   capability set
//! - An in-memory KMS for tests and development (never use it in production)
//! - A per-call timeout wrapper
//! - The process-wide registry that shares one service per endpoint
//!
//! For AWS KMS, see the `plugins` module (`plugins::aws_v2::kms`).

mod in_memory;
mod registry;
mod timeout;

pub use in_memory::{BackendFailure, InMemoryKms};
pub use registry::{
    default_factory, ServiceFactory, ServiceFuture, ServiceRegistry, ServiceSpec, AWS_KMS_SCHEME, MEMORY_SCHEME,
};
pub use timeout::TimeoutService;

#[cfg(feature = "aws-v2-kms")]
pub mod aws {
    pub use crate::plugins::aws_v2::kms::*;
}

use std::collections::BTreeMap;

/// Expected value of [`StatusResponse::healthz`] for a healthy backend
pub const HEALTHZ_OK: &str = "ok";

/// The only KMS API version this crate speaks
pub const KMS_API_VERSION: &str = "v2";

/// Result of wrapping a DEK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResponse {
    /// The wrapped DEK
    pub ciphertext: Vec<u8>,
    /// ID of the KEK that wrapped it
    pub key_id: String,
    /// Opaque metadata to store next to the wrapped DEK
    pub annotations: BTreeMap<String, Vec<u8>>,
}

/// Everything a backend gets back when asked to unwrap a DEK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptRequest {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub annotations: BTreeMap<String, Vec<u8>>,
}

/// Answer to a status probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub healthz: String,
    pub version: String,
    pub key_id: String,
}

impl StatusResponse {
    /// A healthy `v2` response for `key_id`
    pub fn healthy(key_id: impl Into<String>) -> Self {
        Self {
            healthz: HEALTHZ_OK.into(),
            version: KMS_API_VERSION.into(),
            key_id: key_id.into(),
        }
    }

    /// Checks that the backend reports itself healthy, speaks `v2` and has an active key
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.healthz != HEALTHZ_OK {
            return Err(format!("got unexpected healthz status: {}", self.healthz));
        }
        if self.version != KMS_API_VERSION {
            return Err(format!(
                "expected KMSv2 API version {}, got {}",
                KMS_API_VERSION, self.version
            ));
        }
        if self.key_id.is_empty() {
            return Err("got invalid empty keyID".into());
        }
        Ok(())
    }
}
