use crate::clock::Clock;
use crate::key::cache::expires_after;
use crate::key::DataKey;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

struct Entry {
    dek: Arc<DataKey>,
    expires_at: DateTime<Utc>,
}

/// Bounded cache of unwrapped DEKs keyed by their wrapped form.
///
/// Serves reads of values written under older epochs without a KMS round trip. Entries are
/// evicted least-recently-used first and dropped once older than the TTL.
pub struct UnwrapCache {
    entries: Mutex<LruCache<Vec<u8>, Entry>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for UnwrapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwrapCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl UnwrapCache {
    /// Creates a cache holding at most `capacity` keys, each for at most `ttl`
    pub fn new(capacity: usize, ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200)),
            clock,
        }
    }

    /// Looks up the DEK wrapped as `encrypted_dek`
    pub fn get(&self, encrypted_dek: &[u8]) -> Option<Arc<DataKey>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let lookup = entries
            .get(encrypted_dek)
            .map(|entry| (now < entry.expires_at).then(|| entry.dek.clone()));

        match lookup {
            Some(Some(dek)) => Some(dek),
            Some(None) => {
                entries.pop(encrypted_dek);
                None
            },
            None => None,
        }
    }

    /// Remembers that `encrypted_dek` unwraps to `dek`. A TTL reaching past the representable
    /// time range keeps the entry until it is evicted.
    pub fn insert(&self, encrypted_dek: Vec<u8>, dek: Arc<DataKey>) {
        let expires_at = expires_after(self.clock.now(), self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.lock().put(encrypted_dek, Entry { dek, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
