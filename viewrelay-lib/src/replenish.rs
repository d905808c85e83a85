//! Keeps the proxy pool stocked.
//!
//! A refresh cycle sweeps the pool, fetches new candidates from every source
//! when the number of usable proxies is below target, and validates whatever
//! is queued. Only one cycle runs at a time; a forced refresh waits for a
//! running one to finish and then runs its own.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use crate::dispatcher::stopped;
use crate::proxy::{ProxyPool, ProxySource, ProxyState, ProxyValidator, fetch_all};

/// What one refresh cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Dead proxies evicted by the sweep
    pub evicted: usize,
    /// Candidates returned by all sources
    pub fetched: usize,
    /// Candidates that were new to the pool
    pub ingested: usize,
    /// Proxies probed by the validator
    pub validated: usize,
    /// Probed proxies that turned out usable
    pub reachable: usize,
}

/// Fetches, validates and evicts proxies for a [`ProxyPool`]
#[derive(Debug)]
pub struct Replenisher {
    pool: Arc<ProxyPool>,
    validator: ProxyValidator,
    sources: Vec<Box<dyn ProxySource>>,
    cycle: Mutex<()>,
}

impl Replenisher {
    /// Create a replenisher feeding `pool` from `sources`
    #[must_use]
    pub fn new(
        pool: Arc<ProxyPool>,
        validator: ProxyValidator,
        sources: Vec<Box<dyn ProxySource>>,
    ) -> Self {
        Self {
            pool,
            validator,
            sources,
            cycle: Mutex::new(()),
        }
    }

    /// Run one refresh cycle now
    pub async fn refresh(&self) -> RefreshReport {
        let _cycle = self.cycle.lock().await;

        let sweep = self.pool.sweep();
        let usable = self.pool.status().usable();
        let target = self.pool.config().target_size;

        let mut report = RefreshReport {
            evicted: sweep.evicted,
            ..RefreshReport::default()
        };

        if usable < target {
            debug!("{usable} usable proxies, fetching more to reach {target}");
            let candidates = fetch_all(&self.sources).await;
            report.fetched = candidates.len();
            report.ingested = self.pool.ingest(candidates);
        }

        let queued = self.pool.take_validation_queue();
        report.validated = queued.len();
        for verdict in self.validator.validate_batch(queued).await {
            let state = self.pool.apply_verdict(&verdict);
            if matches!(state, Some(ProxyState::Healthy | ProxyState::Degraded)) {
                report.reachable += 1;
            }
        }

        info!(
            "Proxy refresh: {} fetched, {} new, {}/{} reachable, {} evicted",
            report.fetched, report.ingested, report.reachable, report.validated, report.evicted
        );
        report
    }

    /// Refresh every `interval` until `stop` turns `true`.
    ///
    /// The first cycle runs immediately. A cycle still in flight when `stop`
    /// turns `true` is dropped, which cancels its fetches and probes.
    pub async fn run(&self, interval: Duration, stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = std::pin::pin!(stopped(stop));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = &mut stop => break,
            }
            tokio::select! {
                _ = self.refresh() => {}
                () = &mut stop => break,
            }
        }
        debug!("Replenisher stopped");
    }
}
