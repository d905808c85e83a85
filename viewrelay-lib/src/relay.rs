use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::client::ClientBuilder;
use crate::config::Config;
use crate::dispatcher::{DispatchEvent, Dispatcher, HttpRequester, JobHandle, Requester, stopped};
use crate::proxy::{HttpListSource, PoolStatus, ProxyPool, ProxySource, ProxyValidator};
use crate::ratelimit::RateLimiter;
use crate::replenish::{RefreshReport, Replenisher};
use crate::types::{ActorId, ViewJob};
use crate::{ErrorKind, Result};

/// The process-wide entry point.
///
/// Owns the proxy pool, the rate limiter, the dispatcher and the
/// replenisher. Create it once with [`ViewRelay::init`] and tear it down with
/// [`ViewRelay::shutdown`].
///
/// ```no_run
/// use viewrelay_lib::{Config, ViewRelay};
///
/// # async fn run() -> viewrelay_lib::Result<()> {
/// let relay = ViewRelay::init(Config::default())?;
/// relay.force_proxy_refresh().await;
///
/// let handle = relay.submit_view_job("alice", "https://example.com/watch", 10, None)?;
/// let result = handle.result().await?;
/// println!("{} of {} views succeeded", result.succeeded_count, result.requested_count);
///
/// relay.shutdown(std::time::Duration::from_secs(30)).await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ViewRelay {
    config: Config,
    pool: Arc<ProxyPool>,
    limiter: Arc<RateLimiter>,
    dispatcher: Dispatcher,
    replenisher: Arc<Replenisher>,
    stop: watch::Sender<bool>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl ViewRelay {
    /// Set up the relay with the configured HTTP list sources and the default
    /// HTTP requester. No events are emitted.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or an HTTP client cannot be
    /// built.
    pub fn init(config: Config) -> Result<Self> {
        let (sources, requester) = Self::default_parts(&config)?;
        Self::with_parts(config, sources, requester, None)
    }

    /// Like [`ViewRelay::init`], but also returns a receiver for all
    /// [`DispatchEvent`]s.
    ///
    /// The receiver must be drained: once it is full, finishing jobs wait for
    /// room.
    ///
    /// # Errors
    ///
    /// See [`ViewRelay::init`].
    pub fn init_with_events(config: Config) -> Result<(Self, mpsc::Receiver<DispatchEvent>)> {
        let (sources, requester) = Self::default_parts(&config)?;
        let (events, receiver) = mpsc::channel(config.dispatcher.event_buffer.max(1));
        let relay = Self::with_parts(config, sources, requester, Some(events))?;
        Ok((relay, receiver))
    }

    /// Set up the relay with custom sources and transport
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidConfig`] if the configuration is
    /// invalid.
    pub fn with_parts(
        config: Config,
        sources: Vec<Box<dyn ProxySource>>,
        requester: Arc<dyn Requester>,
        events: Option<mpsc::Sender<DispatchEvent>>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ProxyPool::new(config.pool));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&limiter),
            requester,
            config.dispatcher,
            events,
        );
        let replenisher = Arc::new(Replenisher::new(
            Arc::clone(&pool),
            ProxyValidator::new(config.validator.clone()),
            sources,
        ));
        let (stop, _) = watch::channel(false);

        info!(
            "View relay ready: {} sources, {} workers, target pool size {}",
            config.sources.len(),
            config.dispatcher.max_workers,
            config.pool.target_size
        );

        Ok(Self {
            config,
            pool,
            limiter,
            dispatcher,
            replenisher,
            stop,
            housekeeping: Mutex::new(None),
        })
    }

    fn default_parts(config: &Config) -> Result<(Vec<Box<dyn ProxySource>>, Arc<dyn Requester>)> {
        let sources = config
            .sources
            .iter()
            .map(|source| {
                HttpListSource::new(source).map(|source| Box::new(source) as Box<dyn ProxySource>)
            })
            .collect::<Result<Vec<_>>>()?;
        let client_builder = ClientBuilder::builder()
            .timeout(config.dispatcher.request_timeout)
            .build();
        Ok((sources, Arc::new(HttpRequester::new(client_builder))))
    }

    /// The configuration the relay was created with
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The shared proxy pool
    #[must_use]
    pub const fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// The shared rate limiter
    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Submit a job of `count` views of `target` on behalf of `actor`.
    ///
    /// With a `duration_hint`, each attempt waits 80% to 120% of the hint
    /// before it starts; otherwise the configured delay range applies.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::ParseUrl`] for an unparsable target and
    /// otherwise as [`Dispatcher::submit`] does.
    pub fn submit_view_job(
        &self,
        actor: impl Into<ActorId>,
        target: &str,
        count: usize,
        duration_hint: Option<Duration>,
    ) -> Result<JobHandle> {
        let target = Url::parse(target).map_err(|e| ErrorKind::ParseUrl(e, target.to_string()))?;
        let job = match duration_hint {
            Some(hint) => ViewJob::from_duration_hint(actor, target, count, hint),
            None => ViewJob::builder()
                .actor(actor)
                .target(target)
                .requested_count(count)
                .min_delay(self.config.dispatcher.min_delay())
                .max_delay(self.config.dispatcher.max_delay())
                .build(),
        };
        self.submit(job)
    }

    /// Submit a fully specified job
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub fn submit(&self, job: ViewJob) -> Result<JobHandle> {
        self.dispatcher.submit(job)
    }

    /// Count the pool's proxies by state
    #[must_use]
    pub fn query_proxy_pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Run a refresh cycle now, waiting for one already in progress first
    pub async fn force_proxy_refresh(&self) -> RefreshReport {
        self.replenisher.refresh().await
    }

    /// Refresh the pool and prune idle actors every `refresh_interval` until
    /// shutdown. Calling it again while running does nothing.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start_housekeeping(&self) {
        let mut housekeeping = self
            .housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if housekeeping.is_some() {
            return;
        }

        let replenisher = Arc::clone(&self.replenisher);
        let limiter = Arc::clone(&self.limiter);
        let interval = self.config.refresh_interval;
        let stop = self.stop.subscribe();
        *housekeeping = Some(tokio::spawn(async move {
            let prune = async {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut stop = pin!(stopped(stop.clone()));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let pruned = limiter.prune_idle();
                            if pruned > 0 {
                                debug!("Forgot {pruned} idle actors");
                            }
                        }
                        () = &mut stop => break,
                    }
                }
            };
            tokio::join!(replenisher.run(interval, stop.clone()), prune);
        }));
    }

    /// Refuse new jobs, stop housekeeping and wait up to `grace` for running
    /// ones before aborting them.
    ///
    /// Jobs are refused from the moment this is called, even while a proxy
    /// refresh is being cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        self.dispatcher.close();
        self.stop.send_replace(true);
        let task = self
            .housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Housekeeping task failed: {e}");
            }
        }
        self.dispatcher.shutdown(grace).await;
    }

    /// Whether [`ViewRelay::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.dispatcher.is_shut_down()
    }
}
