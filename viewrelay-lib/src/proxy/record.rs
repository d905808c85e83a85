use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::Instant;

use crate::proxy::{PoolConfig, Protocol, ProxyCandidate, ProxyKey, Verdict};

/// Success rate assumed for a proxy nobody has used yet
const INITIAL_SUCCESS_EMA: f64 = 0.5;

/// Health of a proxy as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyState {
    /// Ingested but not yet probed
    Untested,
    /// Validated and working
    Healthy,
    /// Recently failed, still leasable at a lower score
    Degraded,
    /// Failed too often; never leased again
    Dead,
}

impl ProxyState {
    /// Whether [`crate::proxy::ProxyPool::lease`] may hand out a proxy in this state
    #[must_use]
    pub const fn is_leasable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Result of using a proxy, as reported back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request went through
    Success,
    /// The request failed
    Failure,
    /// The request did not finish in time
    Timeout,
}

impl Outcome {
    const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Everything the pool knows about one proxy.
///
/// Records are owned by [`crate::proxy::ProxyPool`]; callers only ever see
/// snapshot copies, so mutating one has no effect on the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    /// Hostname or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Protocol used to talk to the proxy
    pub protocol: Protocol,
    /// When the proxy was last probed by the validator
    pub last_validated_at: Option<Instant>,
    /// Smoothed round-trip latency
    pub latency: Option<Duration>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Exponential moving average of the success rate, in `[0, 1]`
    pub success_ema: f64,
    /// Ranking score; higher is better
    pub score: f64,
    /// Current health
    pub state: ProxyState,
    /// When the proxy was declared dead
    pub dead_since: Option<Instant>,
}

impl ProxyRecord {
    /// Create an untested record for a freshly ingested candidate
    #[must_use]
    pub fn new(candidate: &ProxyCandidate) -> Self {
        Self {
            address: candidate.address.clone(),
            port: candidate.port,
            protocol: candidate.protocol,
            last_validated_at: None,
            latency: None,
            consecutive_failures: 0,
            success_ema: INITIAL_SUCCESS_EMA,
            score: 0.0,
            state: ProxyState::Untested,
            dead_since: None,
        }
    }

    /// Pool key of this record
    #[must_use]
    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(&self.address, self.port)
    }

    /// The candidate this record was created from
    #[must_use]
    pub fn candidate(&self) -> ProxyCandidate {
        ProxyCandidate {
            address: self.address.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// URL suitable for [`reqwest::Proxy::all`]
    #[must_use]
    pub fn proxy_url(&self) -> String {
        self.candidate().proxy_url()
    }

    /// Smoothed latency in whole milliseconds
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency
            .map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX))
    }

    /// Fold the outcome of one use into the record.
    ///
    /// Returns the previous state if the state changed.
    pub(crate) fn record_outcome(
        &mut self,
        outcome: Outcome,
        latency: Option<Duration>,
        config: &PoolConfig,
        now: Instant,
    ) -> Option<ProxyState> {
        let previous = self.state;

        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.observe_success(1.0, config);
            if let Some(latency) = latency {
                self.observe_latency(latency, config);
            }
            // Dead is final until eviction
            if matches!(self.state, ProxyState::Degraded | ProxyState::Untested) {
                self.state = ProxyState::Healthy;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.observe_success(0.0, config);
            self.state = match self.state {
                ProxyState::Dead => ProxyState::Dead,
                _ if self.consecutive_failures >= config.dead_after => ProxyState::Dead,
                ProxyState::Healthy if self.consecutive_failures >= config.degrade_after => {
                    ProxyState::Degraded
                }
                state => state,
            };
        }

        self.rescore(config);
        self.transition_from(previous, now)
    }

    /// Fold a validator verdict into the record.
    ///
    /// An unreachable proxy that was never validated is declared dead at once;
    /// one that used to work is treated like a failed use.
    pub(crate) fn record_verdict(
        &mut self,
        verdict: &Verdict,
        config: &PoolConfig,
        now: Instant,
    ) -> Option<ProxyState> {
        let previous = self.state;
        self.last_validated_at = Some(now);

        if verdict.reachable {
            if self.state == ProxyState::Dead {
                return None;
            }
            self.consecutive_failures = 0;
            self.observe_success(1.0, config);
            self.latency = verdict.latency.or(self.latency);
            self.state = ProxyState::Healthy;
            self.rescore(config);
            return self.transition_from(previous, now);
        }

        match self.state {
            ProxyState::Untested => {
                self.observe_success(0.0, config);
                self.state = ProxyState::Dead;
                self.rescore(config);
                self.transition_from(previous, now)
            }
            _ => {
                let outcome = if verdict.timed_out {
                    Outcome::Timeout
                } else {
                    Outcome::Failure
                };
                self.record_outcome(outcome, None, config, now)
            }
        }
    }

    fn transition_from(&mut self, previous: ProxyState, now: Instant) -> Option<ProxyState> {
        if previous == self.state {
            return None;
        }
        if self.state == ProxyState::Dead {
            self.dead_since = Some(now);
        }
        debug!(
            "Proxy {} moved from {previous} to {} (score {:.3})",
            self.key(),
            self.state,
            self.score
        );
        Some(previous)
    }

    fn observe_success(&mut self, value: f64, config: &PoolConfig) {
        self.success_ema = config.ema_alpha * value + (1.0 - config.ema_alpha) * self.success_ema;
    }

    fn observe_latency(&mut self, latency: Duration, config: &PoolConfig) {
        self.latency = Some(match self.latency {
            Some(previous) => {
                latency.mul_f64(config.ema_alpha) + previous.mul_f64(1.0 - config.ema_alpha)
            }
            None => latency,
        });
    }

    /// `score = w_s * success_ema + w_l * ref / (ref + latency)`
    fn rescore(&mut self, config: &PoolConfig) {
        let latency_term = match self.latency {
            Some(latency) => {
                let reference = config.latency_reference.as_secs_f64();
                if reference + latency.as_secs_f64() > 0.0 {
                    reference / (reference + latency.as_secs_f64())
                } else {
                    1.0
                }
            }
            None => 0.0,
        };
        self.score = config.success_weight * self.success_ema + config.latency_weight * latency_term;
    }
}
