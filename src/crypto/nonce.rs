//! Counter-based nonce construction for AES-GCM under a reused DEK.
//!
//! A nonce is `random_prefix(4) || little_endian_u64(counter)`. The prefix is drawn once per
//! generator, the counter is bumped atomically before every use and never wraps.

use crate::crypto::aead::{fill_random, GCM_NONCE_SIZE};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Starting value of the nonce counter, so low or zero counters stand out when debugging
pub const NONCE_COUNTER_SEED: u64 = 1_000_000_000;

const PREFIX_SIZE: usize = 4;

/// Produces unique 96-bit nonces for one DEK
#[derive(Debug)]
pub struct NonceGenerator {
    prefix: [u8; PREFIX_SIZE],
    counter: AtomicU64,
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceGenerator {
    /// Creates a generator with a fresh random prefix and the seeded counter
    pub fn new() -> Self {
        Self::with_counter(NONCE_COUNTER_SEED)
    }

    /// Creates a generator whose counter starts at `counter`
    pub(crate) fn with_counter(counter: u64) -> Self {
        let mut prefix = [0_u8; PREFIX_SIZE];
        fill_random(&mut prefix);

        Self {
            prefix,
            counter: AtomicU64::new(counter),
        }
    }

    /// Returns the random prefix shared by every nonce of this generator
    pub fn prefix(&self) -> [u8; PREFIX_SIZE] {
        self.prefix
    }

    /// Returns the next nonce.
    ///
    /// Fails with [`Error::Internal`] once the counter is exhausted; the generator then stays
    /// exhausted for good.
    pub fn next(&self) -> Result<[u8; GCM_NONCE_SIZE]> {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| Error::Internal("nonce counter exhausted, refusing to reuse a nonce".into()))?;
        let counter = previous + 1;

        let mut nonce = [0_u8; GCM_NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[PREFIX_SIZE..].copy_from_slice(&counter.to_le_bytes());
        Ok(nonce)
    }
}

/// Splits a nonce into its random prefix and counter
pub fn split_nonce(nonce: &[u8]) -> Option<([u8; PREFIX_SIZE], u64)> {
    if nonce.len() < GCM_NONCE_SIZE {
        return None;
    }

    let mut prefix = [0_u8; PREFIX_SIZE];
    prefix.copy_from_slice(&nonce[..PREFIX_SIZE]);
    let mut counter = [0_u8; 8];
    counter.copy_from_slice(&nonce[PREFIX_SIZE..GCM_NONCE_SIZE]);
    Some((prefix, u64::from_le_bytes(counter)))
}
