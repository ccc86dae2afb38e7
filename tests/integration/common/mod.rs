// Module for common test utilities and fixtures used across integration tests

use futures::FutureExt;
use kmsenvelope::{
    clock::FakeClock,
    kms::{InMemoryKms, ServiceRegistry},
    policy::{EnvelopeConfig, ProviderConfig},
    EncryptionProviders, KeyManagementService, Result, Transformer,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Constants for tests
pub const LOCATION: &str = "/registry/secrets/default/db-password";
pub const ORIGINAL_DATA: &str = "somesupersecretstring!hjdkashfjkdashfd";
pub const DEK_TTL: Duration = Duration::from_secs(180);

// Prefix of every value written by the provider `name`
pub fn prefix(name: &str) -> String {
    format!("k8s:enc:kms:v2:{}:", name)
}

pub fn init_logging() {
    drop(env_logger::builder().is_test(true).try_init());
}

// A registry whose endpoints resolve to pre-built in-memory backends
pub struct Backends {
    pub registry: ServiceRegistry,
    pub connects: Arc<AtomicUsize>,
    kms: HashMap<String, Arc<InMemoryKms>>,
}

impl Backends {
    pub fn new(endpoints: &[&str]) -> Self {
        let kms: HashMap<String, Arc<InMemoryKms>> = endpoints
            .iter()
            .map(|endpoint| (endpoint.to_string(), Arc::new(InMemoryKms::new())))
            .collect();

        let connects = Arc::new(AtomicUsize::new(0));
        let factory_kms = kms.clone();
        let factory_connects = connects.clone();
        let registry = ServiceRegistry::with_factory(Arc::new(move |spec| {
            factory_connects.fetch_add(1, Ordering::SeqCst);
            let backend = factory_kms.get(&spec.endpoint).cloned();
            async move {
                backend
                    .map(|kms| kms as Arc<dyn KeyManagementService>)
                    .ok_or_else(|| kmsenvelope::Error::NotFound(spec.endpoint))
            }
            .boxed()
        }));

        Self {
            registry,
            connects,
            kms,
        }
    }

    pub fn kms(&self, endpoint: &str) -> Arc<InMemoryKms> {
        self.kms[endpoint].clone()
    }
}

// One provider on one in-memory backend, driven by a fake clock
pub struct Harness {
    pub backends: Backends,
    pub clock: Arc<FakeClock>,
    pub providers: EncryptionProviders,
}

impl Harness {
    pub async fn single() -> Self {
        Self::with_config(
            &["mem://kms"],
            EnvelopeConfig::new(vec![ProviderConfig::new("kms-provider", "mem://kms").with_dek_ttl(DEK_TTL)]),
        )
        .await
    }

    pub async fn with_config(endpoints: &[&str], config: EnvelopeConfig) -> Self {
        init_logging();

        let backends = Backends::new(endpoints);
        let clock = Arc::new(FakeClock::default());
        let providers = config
            .build(&backends.registry, clock.clone())
            .await
            .expect("Failed to build providers");

        Self {
            backends,
            clock,
            providers,
        }
    }

    pub fn kms(&self) -> Arc<InMemoryKms> {
        self.backends.kms("mem://kms")
    }
}

// A minimal key-value store that, like a real storage layer, skips writes that would not
// change the stored value and rewrites values reported stale
#[derive(Default)]
pub struct Store {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl Store {
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.values.lock().insert(key.to_string(), value);
    }

    pub async fn update(&self, transformer: &dyn Transformer, key: &str, plaintext: &[u8]) -> Result<()> {
        if let Some(existing) = self.get_raw(key) {
            let (current, stale) = transformer.transform_from_storage(&existing, key).await?;
            if current == plaintext && !stale {
                return Ok(());
            }
        }

        let stored = transformer.transform_to_storage(plaintext, key).await?;
        self.put_raw(key, stored);
        Ok(())
    }
}
