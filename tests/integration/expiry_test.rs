// DEK expiry while the KMS backend is unreachable

use crate::integration::common::{Harness, DEK_TTL, LOCATION, ORIGINAL_DATA};
use kmsenvelope::kms::BackendFailure;
use kmsenvelope::{Error, ErrorKind, Transformer};
use std::time::Duration;

#[tokio::test]
async fn test_writes_continue_inside_validity_window() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();

    chain.transform_to_storage(b"first", LOCATION).await.unwrap();
    harness.kms().set_failure(Some(BackendFailure::Unreachable));

    harness.clock.advance(DEK_TTL - Duration::from_secs(1));
    let stored = chain.transform_to_storage(b"second", LOCATION).await.unwrap();
    let (plaintext, _) = chain.transform_from_storage(&stored, LOCATION).await.unwrap();
    assert_eq!(plaintext, b"second");

    // an unhealthy backend shows up in the health report but does not fail requests
    assert!(!harness.providers.health().health_report().await.is_healthy());
    assert_eq!(harness.kms().encrypt_calls(), 1);
}

#[tokio::test]
async fn test_expired_dek_fails_writes_until_backend_recovers() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();

    let written = chain
        .transform_to_storage(ORIGINAL_DATA.as_bytes(), LOCATION)
        .await
        .unwrap();

    harness.kms().set_failure(Some(BackendFailure::Unreachable));
    harness.clock.advance(DEK_TTL + Duration::from_secs(1));

    let err = chain.transform_to_storage(b"next", LOCATION).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DekExpired);
    assert!(err.to_string().contains("EDEK with keyID \"1\" expired at "));
    match &err {
        Error::Provider { provider, source } => {
            assert_eq!(provider, "kms-provider");
            assert!(matches!(source.as_ref(), Error::DekExpired { key_id, .. } if key_id == "1"));
        },
        other => panic!("unexpected error: {:?}", other),
    }

    harness.kms().set_failure(None);

    let (plaintext, _) = chain.transform_from_storage(&written, LOCATION).await.unwrap();
    assert_eq!(plaintext, ORIGINAL_DATA.as_bytes());

    let stored = chain.transform_to_storage(b"next", LOCATION).await.unwrap();
    let (plaintext, stale) = chain.transform_from_storage(&stored, LOCATION).await.unwrap();
    assert_eq!(plaintext, b"next");
    assert!(!stale);
}

#[tokio::test]
async fn test_disabled_key_is_a_precondition_failure() {
    let harness = Harness::single().await;
    harness.kms().set_failure(Some(BackendFailure::Disabled));

    let err = harness
        .providers
        .chain()
        .transform_to_storage(b"v", LOCATION)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(!err.is_transient());
    assert!(err.to_string().contains("key disabled"));
}
