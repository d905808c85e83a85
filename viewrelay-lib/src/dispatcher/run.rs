use std::collections::HashSet;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{StreamExt, stream};
use log::{debug, trace, warn};
use rand::Rng;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, sleep, sleep_until, timeout};

use crate::dispatcher::exclude::ExcludeSet;
use crate::dispatcher::{AttemptTelemetry, DispatchEvent, DispatcherConfig, Requester};
use crate::proxy::{Outcome, ProxyKey, ProxyPool, ProxyRecord};
use crate::retry::RetryExt;
use crate::types::{AbortReason, FailureKind, FailureRecord, JobId, JobResult, JobState, ViewJob};
use crate::{ErrorKind, Result};

/// How an attempt ended, once all of its tries are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Succeeded,
    Failed,
    /// The pool had nothing to lease although the job excluded nothing
    PoolExhausted,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    proxies_used: Vec<ProxyKey>,
    seen: HashSet<ProxyKey>,
    errors: Vec<FailureRecord>,
}

/// State shared by all attempts of one job while it executes
#[derive(Debug)]
pub(crate) struct JobRun<'a> {
    id: JobId,
    job: &'a ViewJob,
    pool: &'a ProxyPool,
    requester: &'a dyn Requester,
    config: &'a DispatcherConfig,
    workers: &'a Semaphore,
    events: Option<&'a mpsc::Sender<DispatchEvent>>,
    started: Instant,
    excluded: Mutex<ExcludeSet>,
    tally: Mutex<Tally>,
}

impl<'a> JobRun<'a> {
    pub(crate) fn new(
        id: JobId,
        job: &'a ViewJob,
        pool: &'a ProxyPool,
        requester: &'a dyn Requester,
        config: &'a DispatcherConfig,
        workers: &'a Semaphore,
        events: Option<&'a mpsc::Sender<DispatchEvent>>,
    ) -> Self {
        Self {
            id,
            job,
            pool,
            requester,
            config,
            workers,
            events,
            started: Instant::now(),
            excluded: Mutex::new(ExcludeSet::new(config.max_exclusions)),
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Run every attempt until all are done, the deadline passes, or `stop`
    /// resolves. Whatever is still in flight at that point is dropped and
    /// reports nothing to the pool.
    pub(crate) async fn execute<S>(&self, deadline: Instant, stop: S) -> JobResult
    where
        S: Future<Output = ()>,
    {
        let attempts = stream::iter(0..self.job.requested_count())
            .map(|index| self.attempt(index))
            .buffer_unordered(self.config.max_workers.max(1));

        let drive = async {
            let mut attempts = pin!(attempts);
            while let Some(outcome) = attempts.next().await {
                if outcome == AttemptOutcome::PoolExhausted {
                    return Some(AbortReason::PoolExhausted);
                }
            }
            None
        };

        let abort = tokio::select! {
            reason = drive => reason,
            () = sleep_until(deadline) => Some(AbortReason::DeadlineExceeded),
            () = stop => Some(AbortReason::Shutdown),
        };

        self.finish(abort)
    }

    fn finish(&self, abort: Option<AbortReason>) -> JobResult {
        let tally = std::mem::take(&mut *self.lock_tally());
        let requested = self.job.requested_count();
        let state = match abort {
            Some(reason) => JobState::Aborted(reason),
            None if tally.failed == 0 => JobState::Completed,
            None => JobState::PartiallyFailed,
        };
        JobResult {
            job_id: self.id,
            actor: self.job.actor().clone(),
            state,
            requested_count: requested,
            succeeded_count: tally.succeeded,
            failed_count: tally.failed,
            cancelled_count: requested.saturating_sub(tally.succeeded + tally.failed),
            proxies_used: tally.proxies_used,
            errors: tally.errors,
            elapsed: self.started.elapsed(),
        }
    }

    async fn attempt(&self, index: usize) -> AttemptOutcome {
        // The worker semaphore is never closed; if it were, the deadline or
        // the stop signal ends the job
        let Ok(_permit) = self.workers.acquire().await else {
            return std::future::pending().await;
        };

        for try_number in 0..=self.config.attempt_retry_limit {
            let (lease, nothing_excluded) = {
                let excluded = self.lock_excluded();
                (self.pool.lease(excluded.as_set()), excluded.is_empty())
            };
            let proxy = match lease {
                Ok(proxy) => proxy,
                Err(e) => {
                    self.record_failure(index, try_number, None, &e);
                    self.lock_tally().failed += 1;
                    return if nothing_excluded {
                        warn!("Job {} cannot lease any proxy, aborting", self.id);
                        AttemptOutcome::PoolExhausted
                    } else {
                        trace!("Job {} ran out of proxies it has not excluded", self.id);
                        AttemptOutcome::Failed
                    };
                }
            };
            let key = proxy.key();
            self.note_proxy(&key);

            sleep(self.random_delay()).await;

            let started = Instant::now();
            let result = self.perform(&proxy, started).await;
            let elapsed = started.elapsed();

            match result {
                Ok(latency) => {
                    self.pool.report_timed(&key, Outcome::Success, Some(latency));
                    self.telemetry(index, try_number, key, None, elapsed);
                    self.lock_tally().succeeded += 1;
                    return AttemptOutcome::Succeeded;
                }
                Err(e) => {
                    let outcome = if e.is_timeout() {
                        Outcome::Timeout
                    } else {
                        Outcome::Failure
                    };
                    // Excluded before the report can demote it
                    self.lock_excluded().push(key.clone());
                    self.pool.report(&key, outcome);
                    self.record_failure(index, try_number, Some(key.clone()), &e);
                    let failure = Some(FailureKind::from(&e));
                    self.telemetry(index, try_number, key, failure, elapsed);

                    if !e.should_retry() {
                        debug!("Job {} attempt {index}: not retrying after {e}", self.id);
                        break;
                    }
                }
            }
        }

        self.lock_tally().failed += 1;
        AttemptOutcome::Failed
    }

    async fn perform(&self, proxy: &ProxyRecord, started: Instant) -> Result<Duration> {
        match timeout(
            self.config.request_timeout,
            self.requester.perform(proxy, self.job.target()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                trace!(
                    "Request via {} gave up after {:?}",
                    proxy.key(),
                    started.elapsed()
                );
                Err(ErrorKind::AttemptTimeout(self.config.request_timeout))
            }
        }
    }

    fn random_delay(&self) -> Duration {
        let (min, max) = (self.job.min_delay(), self.job.max_delay());
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    fn note_proxy(&self, key: &ProxyKey) {
        let mut tally = self.lock_tally();
        if tally.seen.insert(key.clone()) {
            tally.proxies_used.push(key.clone());
        }
    }

    fn record_failure(
        &self,
        attempt: usize,
        try_number: u32,
        proxy: Option<ProxyKey>,
        error: &ErrorKind,
    ) {
        let record = FailureRecord {
            attempt,
            try_number,
            proxy,
            kind: FailureKind::from(error),
            at: self.started.elapsed(),
        };
        self.lock_tally().errors.push(record);
    }

    fn telemetry(
        &self,
        attempt: usize,
        try_number: u32,
        proxy: ProxyKey,
        failure: Option<FailureKind>,
        elapsed: Duration,
    ) {
        let Some(events) = self.events else {
            return;
        };
        let event = DispatchEvent::Attempt(AttemptTelemetry {
            job_id: self.id,
            attempt,
            try_number,
            proxy,
            failure,
            elapsed,
        });
        if events.try_send(event).is_err() {
            trace!("Dropping attempt telemetry of job {}", self.id);
        }
    }

    fn lock_excluded(&self) -> MutexGuard<'_, ExcludeSet> {
        self.excluded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tally(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
