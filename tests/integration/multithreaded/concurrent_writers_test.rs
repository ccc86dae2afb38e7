// Concurrent writers sharing one provider

use crate::integration::common::{prefix, Harness, ORIGINAL_DATA};
use futures::future::join_all;
use kmsenvelope::crypto::GCM_NONCE_SIZE;
use kmsenvelope::{envelope, Transformer};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task;

const NUM_TASKS: usize = 16;
const OPERATIONS_PER_TASK: usize = 100;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_share_dek_with_unique_nonces() {
    let harness = Arc::new(Harness::single().await);
    harness.kms().set_latency(Some(std::time::Duration::from_millis(20)));

    let tasks: Vec<_> = (0..NUM_TASKS)
        .map(|i| {
            let harness = harness.clone();
            task::spawn(async move {
                let mut written = Vec::with_capacity(OPERATIONS_PER_TASK);
                for j in 0..OPERATIONS_PER_TASK {
                    let location = format!("/registry/secrets/ns-{}/value-{}", i, j);
                    let data = format!("{}_{}_{}", ORIGINAL_DATA, i, j);
                    let stored = harness
                        .providers
                        .chain()
                        .transform_to_storage(data.as_bytes(), &location)
                        .await
                        .expect("Failed to encrypt");
                    written.push((location, data, stored));
                }
                written
            })
        })
        .collect();

    let results = join_all(tasks).await;

    let prefix_len = prefix("kms-provider").len();
    let mut nonces = HashSet::new();
    let mut encrypted_deks = HashSet::new();
    for result in results {
        for (location, data, stored) in result.expect("Task panicked") {
            let object = envelope::decode(&stored, prefix_len).unwrap();
            assert!(nonces.insert(object.encrypted_data[..GCM_NONCE_SIZE].to_vec()));
            encrypted_deks.insert(object.encrypted_dek);

            let (plaintext, stale) = harness
                .providers
                .chain()
                .transform_from_storage(&stored, &location)
                .await
                .unwrap();
            assert_eq!(plaintext, data.as_bytes());
            assert!(!stale);
        }
    }

    assert_eq!(nonces.len(), NUM_TASKS * OPERATIONS_PER_TASK);
    assert_eq!(encrypted_deks.len(), 1);
    assert_eq!(harness.kms().encrypt_calls(), 1);
}
