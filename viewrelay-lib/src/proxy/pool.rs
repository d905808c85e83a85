use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, trace};
use serde::Serialize;
use tokio::time::Instant;

use crate::proxy::{
    Outcome, PoolConfig, ProxyCandidate, ProxyKey, ProxyRecord, ProxyState, Verdict,
};
use crate::{ErrorKind, Result};

/// Counts of proxies per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Validated and working
    pub healthy: usize,
    /// Recently failing but still leasable
    pub degraded: usize,
    /// Waiting for eviction
    pub dead: usize,
    /// Not yet validated
    pub untested: usize,
    /// All records in the pool
    pub total: usize,
}

impl PoolStatus {
    /// Proxies that are leasable now or may become leasable after validation
    #[must_use]
    pub const fn usable(&self) -> usize {
        self.healthy + self.degraded + self.untested
    }
}

/// What a [`ProxyPool::sweep`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Dead records removed after their grace period
    pub evicted: usize,
    /// Records newly queued for revalidation
    pub requeued: usize,
}

/// Holds proxies, ranks them by score and hands them out for single attempts.
///
/// # Architecture
///
/// - Records live in a [`DashMap`] keyed by [`ProxyKey`], so concurrent
///   reports on different proxies only contend on their shard
/// - The ranking is derived from the records and rebuilt lazily by the next
///   [`ProxyPool::lease`] after any change, not on every mutation
/// - Callers only ever receive snapshot clones of [`ProxyRecord`]
/// - Proxies waiting for validation are collected in a queue the
///   replenishment cycle drains with [`ProxyPool::take_validation_queue`]
#[derive(Debug)]
pub struct ProxyPool {
    records: DashMap<ProxyKey, ProxyRecord>,
    ranking: RwLock<Vec<ProxyKey>>,
    ranking_dirty: AtomicBool,
    validation_queue: Mutex<HashSet<ProxyKey>>,
    config: PoolConfig,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ProxyPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            records: DashMap::new(),
            ranking: RwLock::new(Vec::new()),
            ranking_dirty: AtomicBool::new(false),
            validation_queue: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// The pool's scoring configuration
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the best `Healthy` or `Degraded` proxy not in `exclude`.
    ///
    /// Proxies are ordered by score (descending), then latency (ascending),
    /// then validation time (most recent first). A lease is not a lock: the
    /// same proxy may be handed to several attempts at once.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoProxyAvailable`] if nothing is left after
    /// filtering. This never blocks.
    pub fn lease(&self, exclude: &HashSet<ProxyKey>) -> Result<ProxyRecord> {
        if self.ranking_dirty.swap(false, AtomicOrdering::AcqRel) {
            let ranking = self.rank();
            *self.ranking.write().unwrap_or_else(PoisonError::into_inner) = ranking;
        }

        let ranking = self.ranking.read().unwrap_or_else(PoisonError::into_inner);
        ranking
            .iter()
            .filter(|key| !exclude.contains(*key))
            .find_map(|key| {
                self.records
                    .get(key)
                    .filter(|record| record.state.is_leasable())
                    .map(|record| record.clone())
            })
            .ok_or(ErrorKind::NoProxyAvailable)
    }

    /// Record the outcome of an attempt made through `key`
    pub fn report(&self, key: &ProxyKey, outcome: Outcome) {
        self.report_timed(key, outcome, None);
    }

    /// Record the outcome of an attempt along with its observed latency.
    ///
    /// Reports for proxies the pool does not know (anymore) are ignored.
    pub fn report_timed(&self, key: &ProxyKey, outcome: Outcome, latency: Option<Duration>) {
        let Some(mut record) = self.records.get_mut(key) else {
            trace!("Ignoring report for unknown proxy {key}");
            return;
        };
        if record
            .record_outcome(outcome, latency, &self.config, Instant::now())
            .is_some()
            && record.state == ProxyState::Dead
        {
            info!(
                "Proxy {key} declared dead after {} consecutive failures",
                record.consecutive_failures
            );
        }
        drop(record);
        self.ranking_dirty.store(true, AtomicOrdering::Release);
    }

    /// Add candidates as `Untested` records and queue them for validation.
    ///
    /// Candidates whose address and port are already known, in any state,
    /// are skipped. A dead proxy therefore cannot come back before it has
    /// been evicted. Returns the number of records added.
    pub fn ingest<I>(&self, candidates: I) -> usize
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        let mut added = Vec::new();
        for candidate in candidates {
            if let Entry::Vacant(entry) = self.records.entry(candidate.key()) {
                added.push(entry.key().clone());
                entry.insert(ProxyRecord::new(&candidate));
            }
        }

        let count = added.len();
        if count > 0 {
            debug!("Ingested {count} new proxy candidates");
            self.lock_queue().extend(added);
        }
        count
    }

    /// Fold a validator verdict into the matching record.
    ///
    /// Returns the record's new state, or `None` if the proxy is unknown.
    pub fn apply_verdict(&self, verdict: &Verdict) -> Option<ProxyState> {
        let mut record = self.records.get_mut(&verdict.key)?;
        record.record_verdict(verdict, &self.config, Instant::now());
        let state = record.state;
        drop(record);
        self.ranking_dirty.store(true, AtomicOrdering::Release);
        Some(state)
    }

    /// Periodic maintenance.
    ///
    /// Evicts records that have been `Dead` for longer than the grace period
    /// and queues `Untested` and stale `Healthy` records for revalidation.
    /// Calling it again without intervening changes does nothing.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let grace = self.config.dead_grace_period;
        let revalidate_after = self.config.revalidate_after;

        let mut evicted = 0;
        self.records.retain(|key, record| {
            let expired = record.state == ProxyState::Dead
                && record
                    .dead_since
                    .is_some_and(|since| now.duration_since(since) >= grace);
            if expired {
                trace!("Evicting dead proxy {key}");
                evicted += 1;
            }
            !expired
        });

        let stale: Vec<ProxyKey> = self
            .records
            .iter()
            .filter(|record| match record.state {
                ProxyState::Untested => true,
                ProxyState::Healthy => record
                    .last_validated_at
                    .is_none_or(|at| now.duration_since(at) >= revalidate_after),
                ProxyState::Degraded | ProxyState::Dead => false,
            })
            .map(|record| record.key().clone())
            .collect();

        let mut queue = self.lock_queue();
        let requeued = stale.into_iter().filter(|key| queue.insert(key.clone())).count();
        drop(queue);

        if evicted > 0 || requeued > 0 {
            debug!("Sweep evicted {evicted} dead proxies and requeued {requeued} for validation");
        }
        SweepReport { evicted, requeued }
    }

    /// Drain the revalidation queue, returning the candidates still in the pool
    pub fn take_validation_queue(&self) -> Vec<ProxyCandidate> {
        let keys: Vec<ProxyKey> = self.lock_queue().drain().collect();
        keys.iter()
            .filter_map(|key| self.records.get(key).map(|record| record.candidate()))
            .collect()
    }

    /// Number of records waiting for validation
    #[must_use]
    pub fn pending_validation(&self) -> usize {
        self.lock_queue().len()
    }

    /// Count records per state
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus::default();
        for record in &self.records {
            match record.state {
                ProxyState::Healthy => status.healthy += 1,
                ProxyState::Degraded => status.degraded += 1,
                ProxyState::Dead => status.dead += 1,
                ProxyState::Untested => status.untested += 1,
            }
            status.total += 1;
        }
        status
    }

    /// Snapshot of a single record
    #[must_use]
    pub fn get(&self, key: &ProxyKey) -> Option<ProxyRecord> {
        self.records.get(key).map(|record| record.clone())
    }

    /// Snapshot of all records, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        let mut records: Vec<ProxyRecord> =
            self.records.iter().map(|record| record.clone()).collect();
        records.sort_by_key(ProxyRecord::key);
        records
    }

    /// Number of records in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the pool holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn rank(&self) -> Vec<ProxyKey> {
        let mut ranked: Vec<(ProxyKey, f64, Option<Duration>, Option<Instant>)> = self
            .records
            .iter()
            .filter(|record| record.state.is_leasable())
            .map(|record| {
                (
                    record.key().clone(),
                    record.score,
                    record.latency,
                    record.last_validated_at,
                )
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| compare_latency(a.2, b.2))
                .then_with(|| b.3.cmp(&a.3))
        });
        ranked.into_iter().map(|(key, ..)| key).collect()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, HashSet<ProxyKey>> {
        self.validation_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lower latency first; unknown latency last
fn compare_latency(a: Option<Duration>, b: Option<Duration>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
