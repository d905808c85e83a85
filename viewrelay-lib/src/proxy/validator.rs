use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use log::{debug, trace};
use tokio::time::{Instant, timeout};

use crate::cache::TtlCache;
use crate::client::ClientBuilder;
use crate::proxy::{ProxyCandidate, ProxyKey, ValidatorConfig};
use crate::{ErrorKind, Result};

/// Result of probing one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// The probed proxy
    pub key: ProxyKey,
    /// Whether a probe URL answered with a success code through the proxy
    pub reachable: bool,
    /// Round-trip time of the successful probe
    pub latency: Option<Duration>,
    /// Why the proxy is considered unreachable
    pub error: Option<String>,
    /// Whether the probe ran out of time
    pub timed_out: bool,
}

impl Verdict {
    /// Verdict for a proxy that answered in `latency`
    #[must_use]
    pub const fn reachable(key: ProxyKey, latency: Duration) -> Self {
        Self {
            key,
            reachable: true,
            latency: Some(latency),
            error: None,
            timed_out: false,
        }
    }

    /// Verdict for a proxy that could not be used
    #[must_use]
    pub const fn unreachable(key: ProxyKey, error: String, timed_out: bool) -> Self {
        Self {
            key,
            reachable: false,
            latency: None,
            error: Some(error),
            timed_out,
        }
    }

    /// Probe latency in whole milliseconds
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency
            .map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Checks whether candidates can relay a request, and how fast.
///
/// Each probe is an HTTP GET through the candidate against the configured
/// probe URLs, tried in order until one answers with a success code. A probe
/// that exceeds its timeout is dropped, which cancels its network I/O.
/// Verdicts are cached for a while so a proxy is not probed twice in a row.
#[derive(Debug)]
pub struct ProxyValidator {
    config: ValidatorConfig,
    client_builder: ClientBuilder,
    verdicts: TtlCache<ProxyKey, Verdict>,
}

impl Default for ProxyValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl ProxyValidator {
    /// Create a validator
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        let verdicts = TtlCache::new(config.cache_capacity, config.verdict_ttl);
        Self {
            config,
            client_builder: ClientBuilder::builder().timeout(None).build(),
            verdicts,
        }
    }

    /// Use `client_builder` for probe clients.
    ///
    /// Its timeout is ignored; probes are bounded by the validator's own.
    #[must_use]
    pub fn with_client_builder(mut self, client_builder: ClientBuilder) -> Self {
        self.client_builder = client_builder;
        self
    }

    /// The validator's configuration
    #[must_use]
    pub const fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Probe a single candidate, or return its cached verdict
    pub async fn validate(&self, candidate: &ProxyCandidate) -> Verdict {
        let key = candidate.key();
        if let Some(verdict) = self.verdicts.get(&key) {
            trace!("Reusing cached verdict for {key}");
            return verdict;
        }

        let verdict = self.probe(candidate).await;
        match &verdict.error {
            None => debug!("Proxy {key} is reachable ({:?})", verdict.latency),
            Some(error) => debug!("Proxy {key} is unreachable: {error}"),
        }
        self.verdicts.put(key, verdict.clone());
        verdict
    }

    /// Probe many candidates, at most `concurrency` at a time.
    ///
    /// Verdicts are returned in completion order.
    pub async fn validate_batch<I>(&self, candidates: I) -> Vec<Verdict>
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        stream::iter(candidates)
            .map(|candidate| async move { self.validate(&candidate).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    /// Forget all cached verdicts
    pub fn clear_cache(&self) {
        self.verdicts.clear();
    }

    async fn probe(&self, candidate: &ProxyCandidate) -> Verdict {
        let key = candidate.key();
        let client = match self.client_builder.client_for(candidate) {
            Ok(client) => client,
            Err(e) => return Verdict::unreachable(key, e.to_string(), false),
        };

        let started = Instant::now();
        match timeout(self.config.timeout, self.round_trip(&client)).await {
            Ok(Ok(())) => Verdict::reachable(key, started.elapsed()),
            Ok(Err(e)) => {
                let timed_out = e.is_timeout();
                Verdict::unreachable(key, e.to_string(), timed_out)
            }
            Err(_) => {
                let error = ErrorKind::ValidationTimeout(key.clone(), self.config.timeout);
                Verdict::unreachable(key, error.to_string(), true)
            }
        }
    }

    async fn round_trip(&self, client: &reqwest::Client) -> Result<()> {
        let mut last_error =
            ErrorKind::InvalidConfig("no probe URLs configured for validation".to_string());
        for url in &self.config.probe_urls {
            match client.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_error = ErrorKind::RejectedStatusCode(response.status()),
                Err(e) => last_error = ErrorKind::NetworkRequest(e),
            }
        }
        Err(last_error)
    }
}
