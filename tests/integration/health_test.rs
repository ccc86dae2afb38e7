// Composite health of two configured providers

use crate::integration::common::Harness;
use kmsenvelope::health::{HEALTHY_RESULT_TTL, HEALTH_CHECK_NAME};
use kmsenvelope::kms::BackendFailure;
use kmsenvelope::policy::{EnvelopeConfig, ProviderConfig};
use std::time::Duration;

async fn two_providers() -> Harness {
    Harness::with_config(
        &["mem://first", "mem://second"],
        EnvelopeConfig::new(vec![
            ProviderConfig::new("provider-1", "mem://first"),
            ProviderConfig::new("provider-2", "mem://second"),
        ])
        .with_health_timeout(Duration::from_secs(1)),
    )
    .await
}

fn failure(slot: usize, name: &str, detail: &str) -> String {
    format!(
        "kms-provider-{}: failed to perform status section of the healthz check for KMS Provider {}, error: {}",
        slot, name, detail
    )
}

#[tokio::test]
async fn test_health_names_failing_slots() {
    let harness = two_providers().await;
    let health = harness.providers.health();
    let first = harness.backends.kms("mem://first");
    let second = harness.backends.kms("mem://second");

    assert_eq!(health.name(), HEALTH_CHECK_NAME);
    assert_eq!(health.check().await, Ok(()));

    second.set_failure(Some(BackendFailure::Unreachable));
    harness.clock.advance(HEALTHY_RESULT_TTL);
    let report = health.health_report().await;
    assert!(!report.is_healthy());
    assert!(report.providers()[0].ok);
    assert!(!report.providers()[1].ok);
    assert_eq!(
        report.message(),
        failure(1, "provider-2", "kms unavailable: connection refused")
    );

    first.set_failure(Some(BackendFailure::Disabled));
    harness.clock.advance(HEALTHY_RESULT_TTL);
    let report = health.health_report().await;
    assert_eq!(
        report.message(),
        format!(
            "[{}, {}]",
            failure(0, "provider-1", "failed precondition: key disabled"),
            failure(1, "provider-2", "kms unavailable: connection refused")
        )
    );

    first.set_failure(None);
    second.set_failure(None);
    harness.clock.advance(HEALTHY_RESULT_TTL);
    assert_eq!(health.health_report().await.message(), "ok");
}

#[tokio::test]
async fn test_polling_reuses_recent_outcomes() {
    let harness = two_providers().await;
    let health = harness.providers.health();
    let first = harness.backends.kms("mem://first");

    for _ in 0..5 {
        assert!(health.health_report().await.is_healthy());
    }
    assert_eq!(first.status_calls(), 1);

    first.set_failure(Some(BackendFailure::Disabled));
    assert!(health.health_report().await.is_healthy());

    harness.clock.advance(HEALTHY_RESULT_TTL);
    assert!(!health.health_report().await.is_healthy());
    assert_eq!(first.status_calls(), 2);
}

#[tokio::test]
async fn test_providers_on_one_endpoint_report_separately() {
    let harness = Harness::with_config(
        &["mem://shared"],
        EnvelopeConfig::new(vec![
            ProviderConfig::new("a", "mem://shared"),
            ProviderConfig::new("b", "mem://shared"),
        ]),
    )
    .await;

    harness
        .backends
        .kms("mem://shared")
        .set_failure(Some(BackendFailure::Disabled));

    let report = harness.providers.health().health_report().await;
    let names: Vec<_> = report.providers().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert!(report.message().starts_with("[kms-provider-0: "));
    assert_eq!(harness.backends.kms("mem://shared").status_calls(), 2);
}

#[tokio::test]
async fn test_slow_backend_fails_within_deadline() {
    let harness = two_providers().await;
    harness
        .backends
        .kms("mem://first")
        .set_latency(Some(Duration::from_secs(5)));

    let started = std::time::Instant::now();
    let report = harness.providers.health().health_report().await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!report.providers()[0].ok);
    assert!(report.providers()[1].ok);
    assert!(report.message().starts_with("kms-provider-0: "));
}
