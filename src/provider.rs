//! Wiring of configured providers into a chain and a health check

use crate::clock::Clock;
use crate::envelope::chain::ProviderChain;
use crate::envelope::transformer::EnvelopeTransformer;
use crate::error::Result;
use crate::health::{HealthAggregator, ProviderProbe, HEALTHY_RESULT_TTL, UNHEALTHY_RESULT_TTL};
use crate::key::cache::DekCache;
use crate::key::unwrap_cache::UnwrapCache;
use crate::kms::{ServiceRegistry, ServiceSpec};
use crate::policy::{EnvelopeConfig, ProviderConfig};
use crate::KeyManagementService;
use std::sync::Arc;

/// One configured provider: its shared KMS service, DEK cache and transformer
#[derive(Debug)]
pub struct KmsProvider {
    name: String,
    service: Arc<dyn KeyManagementService>,
    dek_cache: Arc<DekCache>,
    transformer: Arc<EnvelopeTransformer>,
}

impl KmsProvider {
    /// Resolves the provider's service through `registry` and builds its caches
    pub async fn new(
        config: &ProviderConfig,
        registry: &ServiceRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let service = registry
            .get_or_create(ServiceSpec {
                provider_name: config.name.clone(),
                endpoint: config.endpoint.clone(),
                timeout: config.timeout,
            })
            .await
            .map_err(|e| e.for_provider(&config.name))?;

        Self::with_service(config, service, clock)
    }

    /// Builds a provider on top of an already connected service
    pub fn with_service(
        config: &ProviderConfig,
        service: Arc<dyn KeyManagementService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dek_cache = Arc::new(DekCache::new(
            config.name.clone(),
            service.clone(),
            clock.clone(),
            config.dek_ttl,
        ));

        let transformer = EnvelopeTransformer::builder()
            .with_provider_name(config.name.clone())
            .with_service(service.clone())
            .with_dek_cache(dek_cache.clone())
            .with_unwrap_cache(UnwrapCache::new(config.cache_size, config.cache_ttl, clock))
            .build()?;

        log::debug!(
            "configured KMS provider {} at {}",
            config.name,
            config.endpoint
        );

        Ok(Self {
            name: config.name.clone(),
            service,
            dek_cache,
            transformer: Arc::new(transformer),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn KeyManagementService> {
        &self.service
    }

    pub fn dek_cache(&self) -> &Arc<DekCache> {
        &self.dek_cache
    }

    pub fn transformer(&self) -> &Arc<EnvelopeTransformer> {
        &self.transformer
    }

    /// A status probe that keeps the DEK cache informed of key rotation and reuses recent
    /// outcomes. Each call returns a probe with its own outcome memory.
    pub fn probe(&self) -> ProviderProbe {
        ProviderProbe::new(self.name.clone(), self.service.clone())
            .with_dek_cache(self.dek_cache.clone())
            .with_result_ttl(HEALTHY_RESULT_TTL, UNHEALTHY_RESULT_TTL, self.dek_cache.clock())
    }
}

/// Everything built from an [`EnvelopeConfig`]
#[derive(Debug)]
pub struct EncryptionProviders {
    providers: Vec<KmsProvider>,
    chain: ProviderChain,
    health: HealthAggregator,
}

impl EncryptionProviders {
    /// Validates `config` and builds every provider in configuration order
    pub async fn from_config(
        config: &EnvelopeConfig,
        registry: &ServiceRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut providers = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            providers.push(KmsProvider::new(provider, registry, clock.clone()).await?);
        }

        let chain = ProviderChain::new(providers.iter().map(|p| p.transformer().clone()).collect())?;
        let health = HealthAggregator::new(
            providers.iter().map(KmsProvider::probe).collect(),
            config.health_timeout,
        );

        Ok(Self {
            providers,
            chain,
            health,
        })
    }

    pub fn providers(&self) -> &[KmsProvider] {
        &self.providers
    }

    /// Writes through the primary, reads through the provider named in the value
    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// The `kms-providers` health check
    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }
}
