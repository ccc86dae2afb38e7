use crate::error::{Error, Result};
use crate::kms::{InMemoryKms, TimeoutService};
use crate::KeyManagementService;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Endpoint scheme of the in-process KMS
pub const MEMORY_SCHEME: &str = "mem://";

/// Endpoint scheme of AWS KMS (`awskms://<region>/<key-id>`)
pub const AWS_KMS_SCHEME: &str = "awskms://";

/// What the registry knows about the caller that first asks for an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub provider_name: String,
    pub endpoint: String,
    pub timeout: Duration,
}

/// Future returned by a [`ServiceFactory`]
pub type ServiceFuture = BoxFuture<'static, Result<Arc<dyn KeyManagementService>>>;

/// Connects to the backend behind an endpoint
pub type ServiceFactory = Arc<dyn Fn(ServiceSpec) -> ServiceFuture + Send + Sync>;

type ServiceCell = Arc<OnceCell<Arc<dyn KeyManagementService>>>;

static GLOBAL: Lazy<ServiceRegistry> = Lazy::new(ServiceRegistry::new);

/// Shares one KMS service per endpoint.
///
/// Concurrent first requests for an endpoint connect exactly once; the timeout and provider
/// name of whichever request wins apply to every later user of that endpoint. A failed
/// connection attempt is not cached.
pub struct ServiceRegistry {
    factory: ServiceFactory,
    services: Mutex<HashMap<String, ServiceCell>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("endpoints", &self.services.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates a registry that connects with [`default_factory`]
    pub fn new() -> Self {
        Self::with_factory(Arc::new(default_factory))
    }

    /// Creates a registry that connects with `factory`
    pub fn with_factory(factory: ServiceFactory) -> Self {
        Self {
            factory,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static ServiceRegistry {
        &GLOBAL
    }

    /// Returns the service for `spec.endpoint`, connecting on first use
    pub async fn get_or_create(&self, spec: ServiceSpec) -> Result<Arc<dyn KeyManagementService>> {
        let cell = {
            let mut services = self.services.lock();
            services.entry(spec.endpoint.clone()).or_default().clone()
        };

        let service = cell
            .get_or_try_init(|| async move {
                log::debug!(
                    "connecting to KMS endpoint {} for provider {}",
                    spec.endpoint,
                    spec.provider_name
                );
                let timeout = spec.timeout;
                let backend = (self.factory)(spec).await?;
                let service: Arc<dyn KeyManagementService> =
                    Arc::new(TimeoutService::new(backend, timeout));
                Ok::<_, Error>(service)
            })
            .await?;

        Ok(service.clone())
    }

    /// Number of endpoints with a connected service
    pub fn len(&self) -> usize {
        self.services
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves `mem://<anything>` to a fresh [`InMemoryKms`] and, with the `aws-v2-kms` feature,
/// `awskms://<region>/<key-id>` to AWS KMS.
pub fn default_factory(spec: ServiceSpec) -> ServiceFuture {
    async move {
        if spec.endpoint.starts_with(MEMORY_SCHEME) {
            return Ok(Arc::new(InMemoryKms::new()) as Arc<dyn KeyManagementService>);
        }

        #[cfg(feature = "aws-v2-kms")]
        {
            if let Some(target) = spec.endpoint.strip_prefix(AWS_KMS_SCHEME) {
                let service = crate::plugins::aws_v2::kms::AwsKmsService::from_target(target).await?;
                return Ok(Arc::new(service) as Arc<dyn KeyManagementService>);
            }
        }

        Err(Error::InvalidArgument(format!(
            "unsupported KMS endpoint {:?} for provider {}",
            spec.endpoint, spec.provider_name
        )))
    }
    .boxed()
}
