// Key rotation as seen through the status probe and the storage layer

use crate::integration::common::{prefix, Harness, Store, LOCATION, ORIGINAL_DATA};
use kmsenvelope::envelope;
use kmsenvelope::policy::{EnvelopeConfig, ProviderConfig};
use kmsenvelope::Transformer;

#[tokio::test]
async fn test_key_id_change_rewrites_only_stale_values() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();
    let store = Store::default();
    let prefix_len = prefix("kms-provider").len();

    store.update(chain, LOCATION, ORIGINAL_DATA.as_bytes()).await.unwrap();
    let first = store.get_raw(LOCATION).unwrap();
    assert_eq!(envelope::decode(&first, prefix_len).unwrap().key_id, "1");

    // a no-op update before the key changes leaves the stored bytes alone
    store.update(chain, LOCATION, ORIGINAL_DATA.as_bytes()).await.unwrap();
    assert_eq!(store.get_raw(LOCATION).unwrap(), first);

    harness.kms().rotate_key();
    let report = harness.providers.health().health_report().await;
    assert!(report.is_healthy());

    let (_, stale) = chain.transform_from_storage(&first, LOCATION).await.unwrap();
    assert!(stale, "the KMS reports a newer key than the one the value was written under");

    let fresh = chain.transform_to_storage(b"other", "/registry/secrets/default/other").await.unwrap();
    let fresh = envelope::decode(&fresh, prefix_len).unwrap();
    let old = envelope::decode(&first, prefix_len).unwrap();
    assert_eq!(fresh.key_id, "2");
    assert_ne!(fresh.encrypted_dek, old.encrypted_dek);

    // the same no-op update now rewrites the value under the new key
    store.update(chain, LOCATION, ORIGINAL_DATA.as_bytes()).await.unwrap();
    let rewritten = store.get_raw(LOCATION).unwrap();
    assert_ne!(rewritten, first);
    assert_eq!(envelope::decode(&rewritten, prefix_len).unwrap().key_id, "2");

    let (plaintext, stale) = chain.transform_from_storage(&rewritten, LOCATION).await.unwrap();
    assert_eq!(plaintext, ORIGINAL_DATA.as_bytes());
    assert!(!stale);

    assert_eq!(harness.kms().encrypt_calls(), 2);
}

#[tokio::test]
async fn test_no_op_updates_alone_rewrite_once_after_key_change() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();
    let store = Store::default();
    let prefix_len = prefix("kms-provider").len();

    store.update(chain, LOCATION, ORIGINAL_DATA.as_bytes()).await.unwrap();
    let before = store.get_raw(LOCATION).unwrap();

    harness.kms().rotate_key();

    let mut versions = vec![before.clone()];
    for _ in 0..5 {
        assert!(harness.providers.health().health_report().await.is_healthy());
        store.update(chain, LOCATION, ORIGINAL_DATA.as_bytes()).await.unwrap();
        let current = store.get_raw(LOCATION).unwrap();
        if versions.last() != Some(&current) {
            versions.push(current);
        }
    }

    assert_eq!(versions.len(), 2, "stored bytes change exactly once");
    assert_eq!(envelope::decode(&versions[1], prefix_len).unwrap().key_id, "2");
    assert_eq!(harness.kms().encrypt_calls(), 2);
}

#[tokio::test]
async fn test_repeated_probes_adopt_new_key_once() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();

    chain.transform_to_storage(b"v", LOCATION).await.unwrap();
    harness.kms().rotate_key();

    for _ in 0..5 {
        harness.providers.health().health_report().await;
    }
    for _ in 0..5 {
        chain.transform_to_storage(b"v", LOCATION).await.unwrap();
    }

    assert_eq!(harness.kms().encrypt_calls(), 2);
}

#[tokio::test]
async fn test_values_of_demoted_provider_are_stale() {
    let harness = Harness::with_config(
        &["mem://old", "mem://new"],
        EnvelopeConfig::new(vec![ProviderConfig::new("old", "mem://old")]),
    )
    .await;
    let written = harness
        .providers
        .chain()
        .transform_to_storage(ORIGINAL_DATA.as_bytes(), LOCATION)
        .await
        .unwrap();

    // same backends, new primary in front
    let promoted = EnvelopeConfig::new(vec![
        ProviderConfig::new("new", "mem://new"),
        ProviderConfig::new("old", "mem://old"),
    ])
    .build(&harness.backends.registry, harness.clock.clone())
    .await
    .unwrap();

    let (plaintext, stale) = promoted.chain().transform_from_storage(&written, LOCATION).await.unwrap();
    assert_eq!(plaintext, ORIGINAL_DATA.as_bytes());
    assert!(stale);

    let rewritten = promoted.chain().transform_to_storage(&plaintext, LOCATION).await.unwrap();
    assert!(rewritten.starts_with(prefix("new").as_bytes()));
}
