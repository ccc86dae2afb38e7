// End to end behaviour of the envelope layer on a single provider

use crate::integration::common::{prefix, Harness, LOCATION, ORIGINAL_DATA};
use kmsenvelope::crypto::{split_nonce, GCM_NONCE_SIZE, NONCE_COUNTER_SEED};
use kmsenvelope::envelope;
use kmsenvelope::{ErrorKind, Transformer};
use std::collections::HashSet;

#[tokio::test]
async fn test_round_trip_various_payloads() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        ORIGINAL_DATA.as_bytes().to_vec(),
        vec![0; 1],
        (0..=255).collect(),
        vec![0xa5; 64 * 1024],
    ];
    let locations = ["/a", LOCATION, "/registry/configmaps/kube-system/ünïcode"];

    for payload in &payloads {
        for location in locations {
            let stored = chain.transform_to_storage(payload, location).await.unwrap();
            let (plaintext, stale) = chain.transform_from_storage(&stored, location).await.unwrap();
            assert_eq!(&plaintext, payload);
            assert!(!stale);
        }
    }
}

#[tokio::test]
async fn test_one_dek_per_epoch() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();
    let prefix_len = prefix("kms-provider").len();

    let mut encrypted_deks = HashSet::new();
    let mut nonces = HashSet::new();
    for i in 0..500 {
        let stored = chain
            .transform_to_storage(format!("{}-{}", ORIGINAL_DATA, i).as_bytes(), LOCATION)
            .await
            .unwrap();
        let object = envelope::decode(&stored, prefix_len).unwrap();

        assert_eq!(object.key_id, "1");
        encrypted_deks.insert(object.encrypted_dek);
        assert!(nonces.insert(object.encrypted_data[..GCM_NONCE_SIZE].to_vec()));
    }

    assert_eq!(encrypted_deks.len(), 1);
    assert_eq!(harness.kms().encrypt_calls(), 1);
}

#[tokio::test]
async fn test_nonce_counter_layout() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();
    let prefix_len = prefix("kms-provider").len();

    let mut prefixes = HashSet::new();
    for expected in 1..=10 {
        let stored = chain.transform_to_storage(b"x", LOCATION).await.unwrap();
        let object = envelope::decode(&stored, prefix_len).unwrap();
        let (nonce_prefix, counter) = split_nonce(&object.encrypted_data).unwrap();

        assert_eq!(counter, NONCE_COUNTER_SEED + expected);
        if expected == 1 {
            assert_eq!(hex::encode(&object.encrypted_data[4..GCM_NONCE_SIZE]), "01ca9a3b00000000");
        }
        assert_ne!(nonce_prefix, [0; 4]);
        prefixes.insert(nonce_prefix);
    }
    assert_eq!(prefixes.len(), 1);
}

#[tokio::test]
async fn test_tampering_never_yields_plaintext() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();
    let prefix_len = prefix("kms-provider").len();

    let stored = chain.transform_to_storage(b"secret", LOCATION).await.unwrap();
    let object = envelope::decode(&stored, prefix_len).unwrap();

    for i in 0..object.encrypted_data.len() {
        for bit in 0..8 {
            let mut tampered = object.clone();
            tampered.encrypted_data[i] ^= 1 << bit;
            let bytes = envelope::encode(&tampered, "kms-provider").unwrap();

            let err = chain.transform_from_storage(&bytes, LOCATION).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
        }
    }

    let mut location = LOCATION.as_bytes().to_vec();
    for i in 0..location.len() {
        location[i] ^= 0x20;
        let other = String::from_utf8_lossy(&location).into_owned();
        let err = chain.transform_from_storage(&stored, &other).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
        location[i] ^= 0x20;
    }
}

#[tokio::test]
async fn test_malformed_values() {
    let harness = Harness::single().await;
    let chain = harness.providers.chain();

    let mut truncated = chain.transform_to_storage(b"secret", LOCATION).await.unwrap();
    truncated.truncate(truncated.len() / 2);

    for value in [
        b"plain text value".to_vec(),
        prefix("kms-provider").into_bytes(),
        truncated,
    ] {
        let err = chain.transform_from_storage(&value, LOCATION).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }
}
