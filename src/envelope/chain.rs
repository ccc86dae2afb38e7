use crate::envelope::transformer::EnvelopeTransformer;
use crate::error::{Error, Result};
use crate::Transformer;
use async_trait::async_trait;
use std::sync::Arc;

/// An ordered list of providers.
///
/// Writes always go to the first (primary) provider. Reads are routed by the stored prefix, so
/// values written by a provider that has since been demoted stay readable; such reads are
/// reported stale so the value gets rewritten under the primary.
#[derive(Debug, Clone)]
pub struct ProviderChain {
    transformers: Vec<Arc<EnvelopeTransformer>>,
}

impl ProviderChain {
    pub fn new(transformers: Vec<Arc<EnvelopeTransformer>>) -> Result<Self> {
        if transformers.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one KMS provider is required".into(),
            ));
        }

        Ok(Self { transformers })
    }

    /// The provider that encrypts new writes
    pub fn primary(&self) -> &Arc<EnvelopeTransformer> {
        &self.transformers[0]
    }

    pub fn transformers(&self) -> &[Arc<EnvelopeTransformer>] {
        &self.transformers
    }
}

#[async_trait]
impl Transformer for ProviderChain {
    async fn transform_to_storage(&self, plaintext: &[u8], location: &str) -> Result<Vec<u8>> {
        self.primary().transform_to_storage(plaintext, location).await
    }

    async fn transform_from_storage(&self, data: &[u8], location: &str) -> Result<(Vec<u8>, bool)> {
        let (index, transformer) = self
            .transformers
            .iter()
            .enumerate()
            .find(|(_, t)| data.starts_with(t.prefix()))
            .ok_or_else(|| {
                Error::MalformedEnvelope("value does not carry the prefix of any KMS provider".into())
            })?;

        let (plaintext, stale) = transformer.transform_from_storage(data, location).await?;
        Ok((plaintext, stale || index != 0))
    }
}
