use crate::clock::Clock;
use crate::envelope::{validate_annotations, validate_encrypted_dek, validate_key_id};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use crate::key::{DataKey, KeyEpoch};
use crate::KeyManagementService;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;

type Refresh = Shared<BoxFuture<'static, Result<Arc<KeyEpoch>>>>;

/// Holds the current [`KeyEpoch`] of one provider and replaces it when needed.
///
/// A new epoch is minted when there is none, when the current one has expired, or when it has
/// been marked stale. Concurrent callers that find the epoch unusable share a single refresh,
/// so at most one `encrypt_dek` call is in flight per provider.
///
/// The cache also remembers the key ID the KMS last reported. Stored values written under any
/// other key ID read back as stale, even before the first write under the new key.
///
/// A failed refresh does not take the provider down while the previous epoch is still inside
/// its validity window; that epoch keeps being served. Once it has expired the failure is
/// reported as [`Error::DekExpired`].
#[derive(Clone)]
pub struct DekCache {
    state: Arc<EpochState>,
}

struct EpochState {
    provider_name: String,
    service: Arc<dyn KeyManagementService>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    current: RwLock<Option<Arc<KeyEpoch>>>,
    stale: AtomicBool,
    /// Key ID last reported by the KMS, from a status probe or a mint
    observed: RwLock<Option<String>>,
    /// Bumped whenever `observed` changes to a different key ID
    observations: AtomicU64,
    inflight: Mutex<Option<Refresh>>,
}

impl fmt::Debug for DekCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DekCache")
            .field("provider_name", &self.state.provider_name)
            .field("ttl", &self.state.ttl)
            .field("key_id", &self.current_key_id())
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl DekCache {
    /// Creates an empty cache; the first epoch is minted on first use
    pub fn new(
        provider_name: impl Into<String>,
        service: Arc<dyn KeyManagementService>,
        clock: Arc<dyn Clock>,
        ttl: std::time::Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));

        Self {
            state: Arc::new(EpochState {
                provider_name: provider_name.into(),
                service,
                clock,
                ttl,
                current: RwLock::new(None),
                stale: AtomicBool::new(false),
                observed: RwLock::new(None),
                observations: AtomicU64::new(0),
                inflight: Mutex::new(None),
            }),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.state.provider_name
    }

    /// The clock that decides expiry
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.state.clock.clone()
    }

    /// Returns an epoch that may be used for a new encryption, minting one if necessary
    pub async fn current_epoch(&self) -> Result<Arc<KeyEpoch>> {
        if let Some(epoch) = self.state.usable() {
            return Ok(epoch);
        }

        let refresh = {
            let mut inflight = self.state.inflight.lock();
            match inflight.as_ref() {
                Some(refresh) if refresh.peek().is_none() => refresh.clone(),
                _ => {
                    // a refresh may have completed between the check above and taking the lock
                    if let Some(epoch) = self.state.usable() {
                        return Ok(epoch);
                    }

                    let state = self.state.clone();
                    let refresh = async move { state.refresh().await }.boxed().shared();
                    *inflight = Some(refresh.clone());
                    refresh
                },
            }
        };

        refresh.await
    }

    /// The current epoch, whatever its state, without refreshing
    pub fn peek(&self) -> Option<Arc<KeyEpoch>> {
        self.state.current.read().clone()
    }

    /// Key ID of the current epoch, if any
    pub fn current_key_id(&self) -> Option<String> {
        self.peek().map(|epoch| epoch.key_id().to_string())
    }

    /// Key ID the KMS reported last, if it has reported one
    pub fn observed_key_id(&self) -> Option<String> {
        self.state.observed.read().clone()
    }

    /// Returns true if a value stored under `key_id` should be rewritten: the key ID differs from
    /// the current epoch's or from the one the KMS last reported
    pub fn is_stale_key_id(&self, key_id: &str) -> bool {
        let differs = |current: Option<&str>| current.map_or(false, |current| current != key_id);

        differs(self.peek().as_deref().map(KeyEpoch::key_id))
            || differs(self.state.observed.read().as_deref())
    }

    /// Returns the current DEK if `encrypted_dek` is the current epoch's wrapped DEK and the
    /// epoch has not expired
    pub fn current_dek_for(&self, encrypted_dek: &[u8]) -> Option<Arc<DataKey>> {
        let epoch = self.peek()?;
        if epoch.is_expired(self.state.clock.now()) {
            return None;
        }

        bool::from(epoch.encrypted_dek().ct_eq(encrypted_dek)).then(|| epoch.shared_dek())
    }

    /// Forces the next encryption to mint a new epoch
    pub fn mark_stale(&self) {
        self.state.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.state.stale.load(Ordering::SeqCst)
    }

    /// Feeds the key ID reported by a successful status probe back into the cache.
    ///
    /// A different key ID marks the epoch stale. The same key ID extends an unexpired epoch by
    /// one TTL from now; an expired epoch is never revived.
    pub fn observe_key_id(&self, key_id: &str) {
        self.state.record_observation(key_id);

        let now = self.state.clock.now();
        let mut current = self.state.current.write();

        let Some(epoch) = current.as_ref() else {
            return;
        };

        if epoch.key_id() != key_id {
            if !self.state.stale.swap(true, Ordering::SeqCst) {
                log::info!(
                    "KMS provider {} reports keyID {} (current {}), DEK will be replaced on next write",
                    self.state.provider_name,
                    key_id,
                    epoch.key_id()
                );
            }
        } else if !epoch.is_expired(now) {
            if let Some(expires_at) = expires_after(now, self.state.ttl) {
                let renewed = Arc::new(epoch.renewed(expires_at));
                *current = Some(renewed);
            }
        }
    }
}

/// `now + ttl`, or `None` when that lies beyond the representable range
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: chrono::Duration) -> Option<DateTime<Utc>> {
    now.checked_add_signed(ttl)
}

impl EpochState {
    fn record_observation(&self, key_id: &str) {
        let mut observed = self.observed.write();
        if observed.as_deref() != Some(key_id) {
            *observed = Some(key_id.to_string());
            self.observations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn usable(&self) -> Option<Arc<KeyEpoch>> {
        if self.stale.load(Ordering::SeqCst) {
            return None;
        }

        let now = self.clock.now();
        self.current
            .read()
            .as_ref()
            .filter(|epoch| !epoch.is_expired(now))
            .cloned()
    }

    async fn refresh(self: Arc<Self>) -> Result<Arc<KeyEpoch>> {
        let previous = self.current.read().clone();
        let observations = self.observations.load(Ordering::SeqCst);

        match self.mint().await {
            Ok(epoch) => {
                let epoch = Arc::new(epoch);
                *self.current.write() = Some(epoch.clone());
                self.settle_observation(observations, epoch.key_id());

                counter!("kms.envelope.dek.refresh", 1, "provider" => self.provider_name.clone());
                log::debug!(
                    "KMS provider {} minted DEK under keyID {}, valid until {}",
                    self.provider_name,
                    epoch.key_id(),
                    epoch.expires_at()
                );
                Ok(epoch)
            },
            Err(err) => {
                counter!("kms.envelope.dek.refresh.failure", 1, "provider" => self.provider_name.clone());

                match previous {
                    Some(epoch) if !epoch.is_expired(self.clock.now()) => {
                        // the next status probe marks the epoch stale again if the key still differs
                        self.stale.store(false, Ordering::SeqCst);
                        *self.observed.write() = Some(epoch.key_id().to_string());
                        log::warn!(
                            "KMS provider {} failed to replace DEK, keeping keyID {} until {}: {}",
                            self.provider_name,
                            epoch.key_id(),
                            epoch.expires_at(),
                            err
                        );
                        Ok(epoch)
                    },
                    Some(epoch) => Err(Error::DekExpired {
                        key_id: epoch.key_id().to_string(),
                        expires_at: epoch.expires_at(),
                        source: Box::new(err),
                    }),
                    None => Err(err),
                }
            },
        }
    }

    /// Adopts the key ID of a freshly minted epoch as the observed one, unless a probe reported a
    /// different key ID while the mint was in flight. In that case the epoch stays stale.
    fn settle_observation(&self, observations_before: u64, minted_key_id: &str) {
        let mut observed = self.observed.write();
        let reported_during_mint = self.observations.load(Ordering::SeqCst) != observations_before;

        if reported_during_mint && observed.as_deref().map_or(false, |id| id != minted_key_id) {
            log::info!(
                "KMS provider {} minted DEK under keyID {} but now reports {:?}, DEK stays stale",
                self.provider_name,
                minted_key_id,
                observed.as_deref()
            );
            return;
        }

        *observed = Some(minted_key_id.to_string());
        self.stale.store(false, Ordering::SeqCst);
    }

    async fn mint(&self) -> Result<KeyEpoch> {
        let expires_at = expires_after(self.clock.now(), self.ttl).ok_or_else(|| {
            Error::InvalidArgument(format!("DEK TTL {} reaches past the supported time range", self.ttl))
        })?;

        let dek = DataKey::generate();
        let response = self.service.encrypt_dek(dek.as_bytes()).await?;

        validate_key_id(&response.key_id)
            .and_then(|_| validate_encrypted_dek(&response.ciphertext))
            .and_then(|_| validate_annotations(&response.annotations))
            .map_err(|e| Error::Internal(format!("invalid KMS encrypt response: {}", e)))?;

        Ok(KeyEpoch::new(
            response.key_id,
            dek,
            response.ciphertext,
            response.annotations,
            expires_at,
        ))
    }
}
