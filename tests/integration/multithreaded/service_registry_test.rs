// One KMS connection per endpoint, whoever asks first

use crate::integration::common::Backends;
use futures::future::join_all;
use kmsenvelope::clock::SystemClock;
use kmsenvelope::kms::ServiceSpec;
use kmsenvelope::policy::{EnvelopeConfig, ProviderConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_connect_once() {
    let backends = Arc::new(Backends::new(&["mem://shared"]));

    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let backends = backends.clone();
            tokio::spawn(async move {
                backends
                    .registry
                    .get_or_create(ServiceSpec {
                        provider_name: format!("provider-{}", i),
                        endpoint: "mem://shared".into(),
                        timeout: Duration::from_secs(3),
                    })
                    .await
            })
        })
        .collect();

    let services: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked").expect("Failed to connect"))
        .collect();

    assert_eq!(backends.connects.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&services[0], &services[1]));
}

#[tokio::test]
async fn test_providers_sharing_endpoint_share_service() {
    let backends = Backends::new(&["mem://a", "mem://b"]);
    let config = EnvelopeConfig::new(vec![
        ProviderConfig::new("one", "mem://a"),
        ProviderConfig::new("two", "mem://b"),
        ProviderConfig::new("three", "mem://a"),
    ]);

    let providers = config
        .build(&backends.registry, Arc::new(SystemClock))
        .await
        .unwrap();
    let built = providers.providers();

    assert_eq!(backends.connects.load(Ordering::SeqCst), 2);
    assert_eq!(backends.registry.len(), 2);
    assert!(Arc::ptr_eq(built[0].service(), built[2].service()));
    assert!(!Arc::ptr_eq(built[0].service(), built[1].service()));
}
