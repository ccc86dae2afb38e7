use crate::error::{Error, Result};
use crate::kms::{DecryptRequest, EncryptResponse, StatusResponse};
use crate::KeyManagementService;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bounds every call to the wrapped service by a fixed timeout.
///
/// A call that does not finish in time fails with [`Error::Unavailable`].
#[derive(Debug, Clone)]
pub struct TimeoutService {
    inner: Arc<dyn KeyManagementService>,
    timeout: Duration,
}

impl TimeoutService {
    pub fn new(inner: Arc<dyn KeyManagementService>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, call: &str, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                log::debug!("KMS {} call timed out after {:?}", call, self.timeout);
                Err(Error::Unavailable(format!(
                    "{} call timed out after {:?}",
                    call, self.timeout
                )))
            },
        }
    }
}

#[async_trait]
impl KeyManagementService for TimeoutService {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<EncryptResponse> {
        self.bounded("encrypt", self.inner.encrypt_dek(plaintext_dek)).await
    }

    async fn decrypt_dek(&self, request: &DecryptRequest) -> Result<Vec<u8>> {
        self.bounded("decrypt", self.inner.decrypt_dek(request)).await
    }

    async fn status(&self) -> Result<StatusResponse> {
        self.bounded("status", self.inner.status()).await
    }
}
