//! Executes admitted view jobs on a bounded pool of concurrent attempts.
//!
//! Each job is split into `requested_count` independent attempts. An attempt
//! leases the best proxy the job has not seen fail, waits a randomized
//! delay, performs the request and reports the outcome back to the pool. A
//! failed attempt is retried through a different proxy up to
//! [`DispatcherConfig::attempt_retry_limit`] times.
//!
//! All jobs share one worker budget of [`DispatcherConfig::max_workers`]
//! attempts in flight. When a job hits its deadline or the dispatcher shuts
//! down, attempts still in flight are dropped and report nothing.

mod config;
mod drain;
mod event;
mod exclude;
mod requester;
mod run;

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

pub use config::{DEFAULT_ATTEMPT_RETRY_LIMIT, DEFAULT_MAX_WORKERS, DispatcherConfig};
pub use event::{AttemptTelemetry, DispatchEvent};
pub use requester::{HttpRequester, Requester};

use crate::proxy::ProxyPool;
use crate::ratelimit::RateLimiter;
use crate::types::{ActorId, JobId, JobResult, JobState, ViewJob};
use crate::{ErrorKind, Result};
use drain::{Drain, DrainGuard};
use run::JobRun;

/// Stand-in for deadlines too far out to represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Handle to a submitted job.
///
/// Dropping the handle does not cancel the job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    state: watch::Receiver<JobState>,
    task: JoinHandle<JobResult>,
}

impl JobHandle {
    /// The job's id
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// The job's current state
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change of the job
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Wait for the job to reach a terminal state
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::JobPanicked`] if the task driving the job
    /// panicked.
    pub async fn result(self) -> Result<JobResult> {
        self.task.await.map_err(ErrorKind::JobPanicked)
    }
}

#[derive(Debug)]
struct Inner {
    pool: Arc<ProxyPool>,
    requester: Arc<dyn Requester>,
    config: DispatcherConfig,
    workers: Semaphore,
    events: Option<mpsc::Sender<DispatchEvent>>,
}

/// Admits jobs through the [`RateLimiter`] and runs them against the
/// [`ProxyPool`]
#[derive(Debug)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    limiter: Arc<RateLimiter>,
    next_id: AtomicU64,
    admission: Mutex<Option<DrainGuard>>,
    drain: Mutex<Option<Drain>>,
    stop: watch::Sender<bool>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// If `events` is given, state changes, attempt telemetry and final
    /// results of every job are sent there.
    #[must_use]
    pub fn new(
        pool: Arc<ProxyPool>,
        limiter: Arc<RateLimiter>,
        requester: Arc<dyn Requester>,
        config: DispatcherConfig,
        events: Option<mpsc::Sender<DispatchEvent>>,
    ) -> Self {
        let inner = Inner {
            pool,
            requester,
            workers: Semaphore::new(config.max_workers.max(1)),
            config,
            events,
        };
        let (stop, _) = watch::channel(false);
        let (drain, admission) = Drain::new();
        Self {
            inner: Arc::new(inner),
            limiter,
            next_id: AtomicU64::new(1),
            admission: Mutex::new(Some(admission)),
            drain: Mutex::new(Some(drain)),
            stop,
        }
    }

    /// The dispatcher's configuration
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Number of worker slots not taken by an attempt right now
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.inner.workers.available_permits()
    }

    /// Validate `job`, charge one admission to its actor and start it.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidJob`] for malformed jobs,
    /// [`ErrorKind::ShuttingDown`] once [`Dispatcher::shutdown`] was called,
    /// and [`ErrorKind::RateLimitExceeded`] if the actor is over its limit.
    /// Nothing is charged to the actor in the first two cases.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn submit(&self, job: ViewJob) -> Result<JobHandle> {
        let submitted_at = Instant::now();
        job.validate()?;

        let guard = lock(&self.admission)
            .clone()
            .ok_or(ErrorKind::ShuttingDown)?;

        let budget = job.deadline().unwrap_or(self.inner.config.default_deadline);
        let deadline = submitted_at
            .checked_add(budget)
            .unwrap_or_else(|| submitted_at + FAR_FUTURE);

        let id = JobId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (state, receiver) = watch::channel(JobState::Queued);

        self.limiter.admit(job.actor(), 1).into_result(job.actor())?;
        self.inner
            .set_state(&state, id, job.actor(), JobState::Admitted);
        info!(
            "Job {id} admitted for {}: {} views of {}",
            job.actor(),
            job.requested_count(),
            job.target()
        );

        let inner = Arc::clone(&self.inner);
        let stop = self.stop.subscribe();
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run(id, job, state, deadline, stop).await
        });

        Ok(JobHandle {
            id,
            state: receiver,
            task,
        })
    }

    /// Refuse all further jobs. Running jobs are not touched.
    pub fn close(&self) {
        if lock(&self.admission).take().is_some() {
            debug!("Dispatcher stopped accepting jobs");
        }
    }

    /// Stop accepting jobs and wait for running ones.
    ///
    /// Jobs still running after `grace` are aborted; their in-flight attempts
    /// are dropped without reporting to the pool. Calling this twice is a
    /// no-op.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        let Some(drain) = lock(&self.drain).take() else {
            return;
        };

        let mut drained = pin!(drain.wait());
        if timeout(grace, &mut drained).await.is_err() {
            warn!("Aborting jobs still running after {grace:?}");
            self.stop.send_replace(true);
            drained.await;
        }
        info!("Dispatcher shut down");
    }

    /// Whether [`Dispatcher::close`] or [`Dispatcher::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        lock(&self.admission).is_none()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    async fn run(
        &self,
        id: JobId,
        job: ViewJob,
        state: watch::Sender<JobState>,
        deadline: Instant,
        stop: watch::Receiver<bool>,
    ) -> JobResult {
        self.set_state(&state, id, job.actor(), JobState::Running);

        let run = JobRun::new(
            id,
            &job,
            &self.pool,
            self.requester.as_ref(),
            &self.config,
            &self.workers,
            self.events.as_ref(),
        );
        let result = run.execute(deadline, stopped(stop)).await;

        info!(
            "Job {id} {}: {} succeeded, {} failed, {} cancelled in {:?}",
            result.state,
            result.succeeded_count,
            result.failed_count,
            result.cancelled_count,
            result.elapsed
        );
        state.send_replace(result.state);
        if let Some(events) = &self.events {
            let terminal = [
                DispatchEvent::StateChanged {
                    job_id: id,
                    actor: job.actor().clone(),
                    state: result.state,
                },
                DispatchEvent::Finished(result.clone()),
            ];
            for event in terminal {
                if events.send(event).await.is_err() {
                    debug!("No one is listening for the outcome of job {id}");
                    break;
                }
            }
        }
        result
    }

    fn set_state(
        &self,
        state: &watch::Sender<JobState>,
        job_id: JobId,
        actor: &ActorId,
        next: JobState,
    ) {
        state.send_replace(next);
        if let Some(events) = &self.events {
            let event = DispatchEvent::StateChanged {
                job_id,
                actor: actor.clone(),
                state: next,
            };
            if events.try_send(event).is_err() {
                debug!("Event channel full or closed, job {job_id} is now {next}");
            }
        }
    }
}

/// Resolves once `stop` flips to `true`.
///
/// A dropped sender means no stop signal will ever come.
pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use test_utils::healthy_pool;
    use url::Url;

    use super::*;
    use crate::proxy::{PoolConfig, ProxyCandidate, ProxyKey, ProxyRecord, ProxyState, Verdict};
    use crate::ratelimit::RateLimitConfig;
    use crate::types::{AbortReason, FailureKind};

    /// Answers from a script keyed by proxy, succeeding for unknown proxies
    #[derive(Debug, Default)]
    struct ScriptedRequester {
        failing: HashMap<ProxyKey, u16>,
        hang: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Requester for ScriptedRequester {
        async fn perform(&self, proxy: &ProxyRecord, _target: &Url) -> Result<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            match self.failing.get(&proxy.key()) {
                Some(status) => Err(ErrorKind::RejectedStatusCode(
                    http::StatusCode::from_u16(*status).unwrap(),
                )),
                None => Ok(Duration::from_millis(50)),
            }
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            max_workers: 4,
            attempt_retry_limit: 2,
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..DispatcherConfig::default()
        }
    }

    fn job(count: usize) -> ViewJob {
        ViewJob::builder()
            .actor("alice")
            .target(Url::parse("https://example.com/watch").unwrap())
            .requested_count(count)
            .min_delay(Duration::ZERO)
            .max_delay(Duration::ZERO)
            .build()
    }

    fn dispatcher(pool: ProxyPool, requester: ScriptedRequester) -> (Dispatcher, Arc<ProxyPool>) {
        let pool = Arc::new(pool);
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Arc::new(RateLimiter::default()),
            Arc::new(requester),
            config(),
            None,
        );
        (dispatcher, pool)
    }

    #[tokio::test]
    async fn test_all_attempts_succeed() {
        let (dispatcher, pool) = dispatcher(healthy_pool!(3), ScriptedRequester::default());

        let handle = dispatcher.submit(job(5)).unwrap();
        let result = handle.result().await.unwrap();

        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.succeeded_count, 5);
        assert_eq!(result.failed_count, 0);
        assert!(result.errors.is_empty());
        assert!(!result.proxies_used.is_empty());
        assert_eq!(pool.status().healthy, 3);
    }

    #[tokio::test]
    async fn test_failed_proxy_is_excluded_for_retries() {
        let best = ProxyKey::new("10.0.0.1", 8000);
        let requester = ScriptedRequester {
            failing: HashMap::from([(best.clone(), 502)]),
            ..ScriptedRequester::default()
        };
        let (dispatcher, pool) = dispatcher(healthy_pool!(2), requester);

        let result = dispatcher.submit(job(1)).unwrap().result().await.unwrap();

        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].proxy, Some(best.clone()));
        assert_eq!(result.errors[0].kind, FailureKind::Status(502));
        assert_eq!(result.proxies_used.len(), 2);
        assert_eq!(pool.get(&best).unwrap().state, ProxyState::Degraded);
    }

    #[tokio::test]
    async fn test_non_retryable_status_ends_attempt() {
        let requester = ScriptedRequester {
            failing: (0..3)
                .map(|i| (ProxyKey::new("10.0.0.1", 8000 + i), 404))
                .collect(),
            ..ScriptedRequester::default()
        };
        let (dispatcher, _pool) = dispatcher(healthy_pool!(3), requester);

        let result = dispatcher.submit(job(1)).unwrap().result().await.unwrap();

        assert_eq!(result.state, JobState::PartiallyFailed);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_aborts_job() {
        let (dispatcher, _pool) =
            dispatcher(ProxyPool::new(PoolConfig::default()), ScriptedRequester::default());

        let result = dispatcher.submit(job(3)).unwrap().result().await.unwrap();

        assert_eq!(result.state, JobState::Aborted(AbortReason::PoolExhausted));
        assert_eq!(result.succeeded_count, 0);
        assert_eq!(result.errors[0].kind, FailureKind::NoProxyAvailable);
        assert_eq!(
            result.failed_count + result.cancelled_count,
            result.requested_count
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_in_flight_attempts() {
        let requester = ScriptedRequester {
            hang: true,
            ..ScriptedRequester::default()
        };
        let (dispatcher, pool) = dispatcher(healthy_pool!(2), requester);
        let job = ViewJob::builder()
            .actor("alice")
            .target(Url::parse("https://example.com/watch").unwrap())
            .requested_count(3)
            .min_delay(Duration::ZERO)
            .max_delay(Duration::ZERO)
            .deadline(Duration::from_secs(5))
            .build();
        let before = pool.snapshot();

        let result = dispatcher.submit(job).unwrap().result().await.unwrap();

        assert_eq!(
            result.state,
            JobState::Aborted(AbortReason::DeadlineExceeded)
        );
        assert_eq!(result.cancelled_count, 3);
        // Cancelled attempts must not touch proxy statistics
        let after = pool.snapshot();
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.success_ema, new.success_ema);
            assert_eq!(old.consecutive_failures, new.consecutive_failures);
        }
    }

    #[tokio::test]
    async fn test_invalid_job_is_not_charged() {
        let (dispatcher, _pool) = dispatcher(healthy_pool!(1), ScriptedRequester::default());

        assert!(matches!(
            dispatcher.submit(job(0)),
            Err(ErrorKind::InvalidJob(_))
        ));
        let usage = dispatcher.limiter.usage(&ActorId::from("alice"));
        assert_eq!(usage.map_or(0, |usage| usage.minute), 0);
    }

    #[tokio::test]
    async fn test_unbounded_deadline_is_accepted() {
        let (dispatcher, _pool) = dispatcher(healthy_pool!(1), ScriptedRequester::default());

        let handle = dispatcher
            .submit(job(2).with_deadline(Duration::MAX))
            .unwrap();
        let result = handle.result().await.unwrap();

        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.succeeded_count, 2);
        let usage = dispatcher.limiter.usage(&ActorId::from("alice")).unwrap();
        assert_eq!(usage.minute, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_submission() {
        let pool = Arc::new(healthy_pool!(1));
        let limiter = RateLimiter::new(RateLimitConfig {
            per_minute: 2,
            ..RateLimitConfig::default()
        });
        let dispatcher = Dispatcher::new(
            pool,
            Arc::new(limiter),
            Arc::new(ScriptedRequester::default()),
            config(),
            None,
        );

        dispatcher.submit(job(1)).unwrap();
        dispatcher.submit(job(1)).unwrap();
        assert!(matches!(
            dispatcher.submit(job(1)),
            Err(ErrorKind::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_budget_is_shared() {
        let requester = ScriptedRequester {
            hang: true,
            ..ScriptedRequester::default()
        };
        let (dispatcher, _pool) = dispatcher(healthy_pool!(2), requester);

        let _first = dispatcher.submit(job(3)).unwrap();
        let _second = dispatcher.submit(job(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.idle_workers(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let requester = ScriptedRequester {
            hang: true,
            ..ScriptedRequester::default()
        };
        let (dispatcher, _pool) = dispatcher(healthy_pool!(1), requester);
        let handle = dispatcher.submit(job(2)).unwrap();

        dispatcher.shutdown(Duration::from_millis(50)).await;

        let result = handle.result().await.unwrap();
        assert_eq!(result.state, JobState::Aborted(AbortReason::Shutdown));
        assert!(matches!(
            dispatcher.submit(job(1)),
            Err(ErrorKind::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (tx, mut rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(
            Arc::new(healthy_pool!(1)),
            Arc::new(RateLimiter::default()),
            Arc::new(ScriptedRequester::default()),
            config(),
            Some(tx),
        );

        let id = dispatcher.submit(job(2)).unwrap().id();
        let mut attempts = 0;
        let finished = loop {
            match rx.recv().await.unwrap() {
                DispatchEvent::Attempt(telemetry) => {
                    assert!(telemetry.succeeded());
                    attempts += 1;
                }
                DispatchEvent::Finished(result) => break result,
                DispatchEvent::StateChanged { job_id, .. } => assert_eq!(job_id, id),
            }
        };

        assert_eq!(attempts, 2);
        assert_eq!(finished.job_id, id);
        assert_eq!(finished.state, JobState::Completed);
    }
}
