use crate::crypto::Aes256GcmAead;
use crate::envelope::{self, EncryptedObject};
use crate::error::{Error, Result};
use crate::key::cache::DekCache;
use crate::key::unwrap_cache::UnwrapCache;
use crate::key::DataKey;
use crate::kms::DecryptRequest;
use crate::policy::{DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL};
use crate::{KeyManagementService, Transformer};

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;

/// Envelope encryption for one KMS provider.
///
/// Writes seal the value under the provider's current DEK with the storage location as
/// authenticated data. Reads locate the DEK by its wrapped form: the current epoch first, then
/// the unwrap cache, then the KMS.
#[derive(Debug)]
pub struct EnvelopeTransformer {
    /// Provider name, part of the storage prefix
    provider_name: String,

    /// `k8s:enc:kms:v2:<provider_name>:`
    prefix: Vec<u8>,

    /// KMS used to unwrap DEKs on read
    service: Arc<dyn KeyManagementService>,

    /// Epoch used for writes
    dek_cache: Arc<DekCache>,

    /// DEKs of older epochs
    unwrap_cache: UnwrapCache,

    cipher: Aes256GcmAead,
}

/// Builder for EnvelopeTransformer
#[derive(Default)]
pub struct EnvelopeTransformerBuilder {
    provider_name: Option<String>,
    service: Option<Arc<dyn KeyManagementService>>,
    dek_cache: Option<Arc<DekCache>>,
    unwrap_cache: Option<UnwrapCache>,
}

impl EnvelopeTransformerBuilder {
    /// Creates a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider name
    pub fn with_provider_name(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = Some(provider_name.into());
        self
    }

    /// Sets the KMS
    pub fn with_service(mut self, service: Arc<dyn KeyManagementService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Sets the DEK cache
    pub fn with_dek_cache(mut self, dek_cache: Arc<DekCache>) -> Self {
        self.dek_cache = Some(dek_cache);
        self
    }

    /// Sets the unwrap cache; defaults to one sized by the default policy
    pub fn with_unwrap_cache(mut self, unwrap_cache: UnwrapCache) -> Self {
        self.unwrap_cache = Some(unwrap_cache);
        self
    }

    /// Builds the EnvelopeTransformer
    pub fn build(self) -> Result<EnvelopeTransformer> {
        let provider_name = self
            .provider_name
            .ok_or_else(|| Error::InvalidArgument("provider_name is required".to_string()))?;
        let service = self
            .service
            .ok_or_else(|| Error::InvalidArgument("service is required".to_string()))?;
        let dek_cache = self
            .dek_cache
            .ok_or_else(|| Error::InvalidArgument("dek_cache is required".to_string()))?;
        let unwrap_cache = self
            .unwrap_cache
            .unwrap_or_else(|| UnwrapCache::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL, dek_cache.clock()));

        if provider_name.is_empty() || provider_name.contains(':') {
            return Err(Error::InvalidArgument(format!(
                "invalid provider name {:?}",
                provider_name
            )));
        }

        Ok(EnvelopeTransformer {
            prefix: envelope::prefix(&provider_name).into_bytes(),
            provider_name,
            service,
            dek_cache,
            unwrap_cache,
            cipher: Aes256GcmAead::new(),
        })
    }
}

impl EnvelopeTransformer {
    /// Creates a new builder for EnvelopeTransformer
    pub fn builder() -> EnvelopeTransformerBuilder {
        EnvelopeTransformerBuilder::new()
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// The storage prefix of this provider
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn dek_cache(&self) -> &Arc<DekCache> {
        &self.dek_cache
    }

    async fn seal(&self, plaintext: &[u8], location: &str) -> Result<Vec<u8>> {
        let epoch = self.dek_cache.current_epoch().await?;
        let nonce = epoch.next_nonce()?;

        let encrypted_data =
            self.cipher
                .seal_value(epoch.dek().as_bytes(), &nonce, plaintext, location.as_bytes())?;

        let object = EncryptedObject {
            encrypted_data,
            key_id: epoch.key_id().to_string(),
            encrypted_dek: epoch.encrypted_dek().to_vec(),
            annotations: epoch.annotations().clone(),
        };
        envelope::encode(&object, &self.provider_name)
    }

    async fn open(&self, data: &[u8], location: &str) -> Result<(Vec<u8>, bool)> {
        if !data.starts_with(&self.prefix) {
            return Err(Error::MalformedEnvelope(format!(
                "value does not start with the prefix of provider {}",
                self.provider_name
            )));
        }

        let object = envelope::decode(data, self.prefix.len())?;
        let dek = self.data_key_for(&object).await?;

        let plaintext = self
            .cipher
            .open_value(dek.as_bytes(), &object.encrypted_data, location.as_bytes())
            .map_err(|e| match e {
                Error::DecryptionFailed(msg) => {
                    Error::DecryptionFailed(format!("{} (keyID {})", msg, object.key_id))
                },
                other => other,
            })?;

        let stale = self.dek_cache.is_stale_key_id(&object.key_id);
        if stale {
            counter!("kms.envelope.decrypt.stale", 1, "provider" => self.provider_name.clone());
        }

        Ok((plaintext, stale))
    }

    async fn data_key_for(&self, object: &EncryptedObject) -> Result<Arc<DataKey>> {
        if let Some(dek) = self.dek_cache.current_dek_for(&object.encrypted_dek) {
            return Ok(dek);
        }

        if let Some(dek) = self.unwrap_cache.get(&object.encrypted_dek) {
            counter!("kms.envelope.unwrap_cache.hit", 1, "provider" => self.provider_name.clone());
            return Ok(dek);
        }

        counter!("kms.envelope.unwrap_cache.miss", 1, "provider" => self.provider_name.clone());
        log::debug!(
            "KMS provider {} unwrapping DEK of keyID {}",
            self.provider_name,
            object.key_id
        );

        let material = self
            .service
            .decrypt_dek(&DecryptRequest {
                ciphertext: object.encrypted_dek.clone(),
                key_id: object.key_id.clone(),
                annotations: object.annotations.clone(),
            })
            .await?;
        let dek = Arc::new(DataKey::from_vec(material)?);

        self.unwrap_cache
            .insert(object.encrypted_dek.clone(), dek.clone());
        Ok(dek)
    }
}

#[async_trait]
impl Transformer for EnvelopeTransformer {
    async fn transform_to_storage(&self, plaintext: &[u8], location: &str) -> Result<Vec<u8>> {
        let start = Instant::now();
        counter!("kms.envelope.encrypt", 1, "provider" => self.provider_name.clone());

        let result = self
            .seal(plaintext, location)
            .await
            .map_err(|e| e.for_provider(&self.provider_name));

        if result.is_err() {
            counter!("kms.envelope.encrypt.failure", 1, "provider" => self.provider_name.clone());
        }
        histogram!("kms.envelope.encrypt.time", start.elapsed(), "provider" => self.provider_name.clone());
        result
    }

    async fn transform_from_storage(&self, data: &[u8], location: &str) -> Result<(Vec<u8>, bool)> {
        let start = Instant::now();
        counter!("kms.envelope.decrypt", 1, "provider" => self.provider_name.clone());

        let result = self
            .open(data, location)
            .await
            .map_err(|e| e.for_provider(&self.provider_name));

        if result.is_err() {
            counter!("kms.envelope.decrypt.failure", 1, "provider" => self.provider_name.clone());
        }
        histogram!("kms.envelope.decrypt.time", start.elapsed(), "provider" => self.provider_name.clone());
        result
    }
}
