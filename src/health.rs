//! Aggregated health of all configured KMS providers
//!
//! One report covers every provider, probed concurrently under a shared deadline. The report
//! is plain text for the host's health endpoint: `ok`, or the failing provider slots by
//! configuration position with each backend's error text.
//!
//! A probe may remember its last outcome for a while, so a host polling its health endpoint
//! does not turn every poll into a status call per backend.

use crate::clock::Clock;
use crate::key::cache::{expires_after, DekCache};
use crate::KeyManagementService;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Name under which the composite check is registered with the host
pub const HEALTH_CHECK_NAME: &str = "kms-providers";

/// Default deadline of one health report
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a healthy probe outcome is reused
pub const HEALTHY_RESULT_TTL: Duration = Duration::from_secs(20);

/// How long a failed probe outcome is reused
pub const UNHEALTHY_RESULT_TTL: Duration = Duration::from_secs(3);

type Outcome = std::result::Result<(), String>;

#[derive(Debug)]
struct ResultCache {
    healthy_ttl: chrono::Duration,
    unhealthy_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    last: Mutex<Option<(Outcome, DateTime<Utc>)>>,
}

impl ResultCache {
    fn get(&self) -> Option<Outcome> {
        let now = self.clock.now();
        self.last
            .lock()
            .as_ref()
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(outcome, _)| outcome.clone())
    }

    fn put(&self, outcome: &Outcome) {
        let ttl = if outcome.is_ok() { self.healthy_ttl } else { self.unhealthy_ttl };
        let Some(expires_at) = expires_after(self.clock.now(), ttl) else {
            return;
        };
        *self.last.lock() = Some((outcome.clone(), expires_at));
    }
}

/// Probes the status of one provider
#[derive(Debug, Clone)]
pub struct ProviderProbe {
    name: String,
    service: Arc<dyn KeyManagementService>,
    dek_cache: Option<Arc<DekCache>>,
    results: Option<Arc<ResultCache>>,
}

impl ProviderProbe {
    pub fn new(name: impl Into<String>, service: Arc<dyn KeyManagementService>) -> Self {
        Self {
            name: name.into(),
            service,
            dek_cache: None,
            results: None,
        }
    }

    /// Reuses a healthy outcome for `healthy_ttl` and a failed one for `unhealthy_ttl`, as
    /// measured by `clock`
    pub fn with_result_ttl(mut self, healthy_ttl: Duration, unhealthy_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let to_chrono = |ttl: Duration| chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        self.results = Some(Arc::new(ResultCache {
            healthy_ttl: to_chrono(healthy_ttl),
            unhealthy_ttl: to_chrono(unhealthy_ttl),
            clock,
            last: Mutex::new(None),
        }));
        self
    }

    /// Forwards the key ID of every healthy status to `dek_cache`
    pub fn with_dek_cache(mut self, dek_cache: Arc<DekCache>) -> Self {
        self.dek_cache = Some(dek_cache);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one status probe, or returns the remembered outcome of a recent one
    pub async fn check(&self) -> Outcome {
        if let Some(outcome) = self.results.as_ref().and_then(|results| results.get()) {
            return outcome;
        }

        let outcome = self.probe_status().await;
        if let Some(results) = &self.results {
            results.put(&outcome);
        }
        outcome
    }

    async fn probe_status(&self) -> Outcome {
        let detail = match self.service.status().await {
            Ok(status) => match status.check() {
                Ok(()) => {
                    if let Some(dek_cache) = &self.dek_cache {
                        dek_cache.observe_key_id(&status.key_id);
                    }
                    return Ok(());
                },
                Err(detail) => detail,
            },
            Err(err) => err.to_string(),
        };

        Err(self.failure(&detail))
    }

    fn failure(&self, detail: &str) -> String {
        format!(
            "failed to perform status section of the healthz check for KMS Provider {}, error: {}",
            self.name, detail
        )
    }
}

/// Probe outcome of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHealth {
    pub name: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Outcome of probing every provider, in configuration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    providers: Vec<ProviderHealth>,
}

impl HealthReport {
    pub fn new(providers: Vec<ProviderHealth>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[ProviderHealth] {
        &self.providers
    }

    pub fn is_healthy(&self) -> bool {
        self.providers.iter().all(|p| p.ok)
    }

    /// The failing slots as `kms-provider-<position>: <error>`
    pub fn failures(&self) -> Vec<String> {
        self.providers
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.ok)
            .map(|(i, p)| format!("kms-provider-{}: {}", i, p.error.as_deref().unwrap_or_default()))
            .collect()
    }

    /// `ok`, the single failure, or `[first, second, ...]`
    pub fn message(&self) -> String {
        let failures = self.failures();
        match failures.len() {
            0 => "ok".to_string(),
            1 => failures.concat(),
            _ => format!("[{}]", failures.join(", ")),
        }
    }

    /// Converts the report into the host's health check result
    pub fn into_result(self) -> std::result::Result<(), String> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(self.message())
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// The composite `kms-providers` health check
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    probes: Vec<ProviderProbe>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(probes: Vec<ProviderProbe>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    pub fn name(&self) -> &'static str {
        HEALTH_CHECK_NAME
    }

    pub fn probes(&self) -> &[ProviderProbe] {
        &self.probes
    }

    /// Probes every provider concurrently and collects the outcomes
    pub async fn health_report(&self) -> HealthReport {
        let deadline = Instant::now() + self.timeout;

        let outcomes = futures::future::join_all(self.probes.iter().map(|probe| async move {
            match tokio::time::timeout_at(deadline, probe.check()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(probe.failure(&format!("status probe timed out after {:?}", self.timeout))),
            }
        }))
        .await;

        let providers = self
            .probes
            .iter()
            .zip(outcomes)
            .map(|(probe, outcome)| {
                if let Err(error) = &outcome {
                    counter!("kms.envelope.health.failure", 1, "provider" => probe.name.clone());
                    log::warn!("{}", error);
                }

                ProviderHealth {
                    name: probe.name.clone(),
                    ok: outcome.is_ok(),
                    error: outcome.err(),
                }
            })
            .collect();

        HealthReport::new(providers)
    }

    /// Runs a report and converts it into the host's health check result
    pub async fn check(&self) -> std::result::Result<(), String> {
        self.health_report().await.into_result()
    }
}
