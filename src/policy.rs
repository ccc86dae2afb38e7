use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::health::DEFAULT_HEALTH_TIMEOUT;
use crate::kms::ServiceRegistry;
use crate::provider::EncryptionProviders;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time;

/// Default values for ProviderConfig
pub const DEFAULT_CALL_TIMEOUT: time::Duration = time::Duration::from_secs(3);
pub const DEFAULT_DEK_TTL: time::Duration = time::Duration::from_secs(60 * 3); // 3 minutes
pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CACHE_TTL: time::Duration = time::Duration::from_secs(60 * 60); // 1 hour

/// Upper bound accepted for `dekTtl` and `cacheTtl`
pub const MAX_TTL: time::Duration = time::Duration::from_secs(100 * 365 * 24 * 60 * 60); // 100 years

/// Configuration of one KMS provider
///
/// Durations are written in humantime notation (`3s`, `3m`, `1h`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider name, part of the storage prefix of every value it writes
    pub name: String,

    /// KMS endpoint, e.g. `mem://local` or `awskms://us-west-2/alias/etcd`
    pub endpoint: String,

    /// Timeout of every KMS call
    #[serde(default = "default_call_timeout", with = "humantime_duration")]
    pub timeout: time::Duration,

    /// How long a DEK may be used for new encryptions
    #[serde(default = "default_dek_ttl", with = "humantime_duration")]
    pub dek_ttl: time::Duration,

    /// Maximum number of unwrapped DEKs kept for reads
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// How long an unwrapped DEK is kept for reads
    #[serde(default = "default_cache_ttl", with = "humantime_duration")]
    pub cache_ttl: time::Duration,
}

fn default_call_timeout() -> time::Duration {
    DEFAULT_CALL_TIMEOUT
}

fn default_dek_ttl() -> time::Duration {
    DEFAULT_DEK_TTL
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_cache_ttl() -> time::Duration {
    DEFAULT_CACHE_TTL
}

fn default_health_timeout() -> time::Duration {
    DEFAULT_HEALTH_TIMEOUT
}

impl ProviderConfig {
    /// Creates a provider configuration with default timeouts and cache sizes
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            dek_ttl: DEFAULT_DEK_TTL,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Sets the KMS call timeout
    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long a DEK is used for new encryptions
    pub fn with_dek_ttl(mut self, dek_ttl: time::Duration) -> Self {
        self.dek_ttl = dek_ttl;
        self
    }

    /// Sets the size of the read-side DEK cache
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Sets the TTL of the read-side DEK cache
    pub fn with_cache_ttl(mut self, cache_ttl: time::Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("provider name must not be empty".into()));
        }
        if self.name.contains(':') {
            return Err(Error::InvalidArgument(format!(
                "provider name {:?} must not contain ':'",
                self.name
            )));
        }
        if self.endpoint.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "provider {} has no endpoint",
                self.name
            )));
        }

        let zero = [
            ("timeout", self.timeout),
            ("dekTtl", self.dek_ttl),
            ("cacheTtl", self.cache_ttl),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((field, _)) = zero {
            return Err(Error::InvalidArgument(format!(
                "provider {}: {} must be greater than zero",
                self.name, field
            )));
        }

        let too_long = [("dekTtl", self.dek_ttl), ("cacheTtl", self.cache_ttl)]
            .into_iter()
            .find(|(_, d)| *d > MAX_TTL);
        if let Some((field, _)) = too_long {
            return Err(Error::InvalidArgument(format!(
                "provider {}: {} must not exceed {}",
                self.name,
                field,
                humantime::format_duration(MAX_TTL)
            )));
        }

        if self.cache_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "provider {}: cacheSize must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Configuration of every KMS provider, primary first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeConfig {
    pub providers: Vec<ProviderConfig>,

    /// Deadline of one aggregated health report
    #[serde(default = "default_health_timeout", with = "humantime_duration")]
    pub health_timeout: time::Duration,
}

impl EnvelopeConfig {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Sets the health report deadline
    pub fn with_health_timeout(mut self, health_timeout: time::Duration) -> Self {
        self.health_timeout = health_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one KMS provider is required".into(),
            ));
        }
        if self.health_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "healthTimeout must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate provider name {}",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    /// Connects every provider and wires the chain and the health check
    pub async fn build(
        &self,
        registry: &ServiceRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<EncryptionProviders> {
        EncryptionProviders::from_config(self, registry, clock).await
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
