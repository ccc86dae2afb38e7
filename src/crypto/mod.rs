//! Cryptographic primitives used by the envelope transformer

mod aead;
pub mod aes256gcm;
pub mod nonce;

pub use aead::{fill_random, GCM_NONCE_SIZE, GCM_TAG_SIZE};
pub use aes256gcm::Aes256GcmAead;
pub use nonce::{split_nonce, NonceGenerator, NONCE_COUNTER_SEED};
