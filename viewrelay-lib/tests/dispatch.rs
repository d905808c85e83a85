use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use test_utils::{healthy_pool, proxy_list_server};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;
use viewrelay_lib::proxy::{
    PoolConfig, Protocol, ProxyCandidate, ProxyPool, ProxyRecord, ProxySource, ProxyState,
    StaticSource, ValidatorConfig, Verdict,
};
use viewrelay_lib::ratelimit::{RateLimitConfig, RateLimiter};
use viewrelay_lib::{
    AbortReason, Config, DispatchEvent, Dispatcher, DispatcherConfig, ErrorKind, FailureKind,
    JobState, Requester, Result, ViewJob, ViewRelay,
};

/// Every request through every proxy fails with a connection error
#[derive(Debug, Default)]
struct FailingRequester {
    calls: AtomicUsize,
}

#[async_trait]
impl Requester for FailingRequester {
    async fn perform(&self, proxy: &ProxyRecord, _target: &Url) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ErrorKind::AttemptFailure {
            proxy: proxy.key(),
            reason: "connection reset by peer".to_string(),
        })
    }
}

/// Succeeds after a short pause
#[derive(Debug, Default)]
struct SteadyRequester;

#[async_trait]
impl Requester for SteadyRequester {
    async fn perform(&self, _proxy: &ProxyRecord, _target: &Url) -> Result<Duration> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Duration::from_millis(5))
    }
}

fn dispatcher_config(retry_limit: u32) -> DispatcherConfig {
    DispatcherConfig {
        max_workers: 8,
        attempt_retry_limit: retry_limit,
        min_delay_ms: 0,
        max_delay_ms: 0,
        ..DispatcherConfig::default()
    }
}

fn job(actor: &str, count: usize) -> ViewJob {
    ViewJob::builder()
        .actor(actor)
        .target(Url::parse("https://example.com/watch?v=1").unwrap())
        .requested_count(count)
        .min_delay(Duration::ZERO)
        .max_delay(Duration::ZERO)
        .build()
}

#[tokio::test]
async fn test_every_proxy_failing_gives_partial_failure() {
    let pool = Arc::new(healthy_pool!(5));
    let requester = Arc::new(FailingRequester::default());
    let dispatcher = Dispatcher::new(
        Arc::clone(&pool),
        Arc::new(RateLimiter::default()),
        requester.clone(),
        dispatcher_config(2),
        None,
    );

    let result = dispatcher.submit(job("alice", 10)).unwrap().result().await.unwrap();

    assert_eq!(result.state, JobState::PartiallyFailed);
    assert_eq!(result.succeeded_count, 0);
    assert_eq!(result.failed_count, 10);
    assert_eq!(result.cancelled_count, 0);
    // Each attempt makes at most 1 + retry_limit requests
    assert!(requester.calls.load(Ordering::SeqCst) <= 30);
    // Every proxy was tried and failed at least once
    assert_eq!(pool.status().healthy, 0);
}

#[tokio::test]
async fn test_sixteenth_submission_is_rate_limited() {
    let limiter = RateLimiter::new(RateLimitConfig {
        per_minute: 15,
        ..RateLimitConfig::default()
    });
    let dispatcher = Dispatcher::new(
        Arc::new(healthy_pool!(3)),
        Arc::new(limiter),
        Arc::new(SteadyRequester),
        dispatcher_config(0),
        None,
    );

    let handles: Vec<_> = (0..15)
        .map(|_| dispatcher.submit(job("bob", 1)).unwrap())
        .collect();
    let denied = dispatcher.submit(job("bob", 1));

    match denied {
        Err(ErrorKind::RateLimitExceeded { actor, retry_after }) => {
            assert_eq!(actor.as_str(), "bob");
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected a rate limit error, got {other:?}"),
    }
    // Other actors are unaffected
    assert!(dispatcher.submit(job("carol", 1)).is_ok());

    for handle in handles {
        assert!(handle.result().await.unwrap().is_success());
    }
}

#[tokio::test]
async fn test_lease_on_empty_pool_does_not_block() {
    let pool = ProxyPool::new(PoolConfig::default());
    let lease = tokio::time::timeout(Duration::from_millis(100), async {
        pool.lease(&HashSet::new())
    })
    .await
    .unwrap();
    assert!(matches!(lease, Err(ErrorKind::NoProxyAvailable)));
}

#[tokio::test]
async fn test_job_on_empty_pool_is_aborted() {
    let dispatcher = Dispatcher::new(
        Arc::new(ProxyPool::new(PoolConfig::default())),
        Arc::new(RateLimiter::default()),
        Arc::new(SteadyRequester),
        dispatcher_config(2),
        None,
    );

    let result = dispatcher.submit(job("alice", 4)).unwrap().result().await.unwrap();

    assert_eq!(result.state, JobState::Aborted(AbortReason::PoolExhausted));
    assert_eq!(result.succeeded_count, 0);
    assert!(
        result
            .errors
            .iter()
            .all(|e| e.kind == FailureKind::NoProxyAvailable)
    );
}

#[tokio::test]
async fn test_terminal_events_reach_the_collaborator() {
    let (events, mut receiver) = mpsc::channel(4);
    let dispatcher = Dispatcher::new(
        Arc::new(healthy_pool!(2)),
        Arc::new(RateLimiter::default()),
        Arc::new(SteadyRequester),
        dispatcher_config(0),
        Some(events),
    );

    // A small channel only loses telemetry, never the outcome
    let id = dispatcher.submit(job("alice", 20)).unwrap().id();

    let mut terminal = None;
    let mut finished = None;
    while finished.is_none() {
        match receiver.recv().await.unwrap() {
            DispatchEvent::StateChanged { state, .. } if state.is_terminal() => {
                terminal = Some(state);
            }
            DispatchEvent::Finished(result) => finished = Some(result),
            _ => {}
        }
    }

    let finished = finished.unwrap();
    assert_eq!(finished.job_id, id);
    assert_eq!(terminal, Some(JobState::Completed));
    assert_eq!(finished.succeeded_count, 20);
}

#[tokio::test]
async fn test_relay_end_to_end() {
    let proxy = test_utils::mock_server!(http::StatusCode::OK);
    let list = proxy_list_server!(proxy.address(), "not a proxy", "127.0.0.1:1");

    let config = Config {
        validator: ValidatorConfig {
            timeout: Duration::from_secs(5),
            probe_urls: vec![Url::parse("http://probe.test/ip").unwrap()],
            ..ValidatorConfig::default()
        },
        dispatcher: dispatcher_config(1),
        ..Config::default()
    };
    let source = viewrelay_lib::proxy::HttpListSource::new(&viewrelay_lib::proxy::SourceConfig {
        url: Url::parse(&format!("{}/proxies.txt", list.uri())).unwrap(),
        protocol: Protocol::Http,
        limit: 30,
    })
    .unwrap();
    let sources: Vec<Box<dyn ProxySource>> = vec![Box::new(source)];
    let relay = ViewRelay::with_parts(config, sources, Arc::new(SteadyRequester), None).unwrap();

    let report = relay.force_proxy_refresh().await;
    assert_eq!(report.fetched, 2);
    assert_eq!(report.reachable, 1);

    let status = relay.query_proxy_pool_status();
    assert_eq!(status.healthy, 1);
    assert_eq!(status.dead, 1);

    let handle = relay
        .submit_view_job("alice", "https://example.com/watch", 3, None)
        .unwrap();
    let result = handle.result().await.unwrap();
    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.proxies_used.len(), 1);

    relay.shutdown(Duration::from_secs(1)).await;
    assert!(relay.is_shut_down());
    assert!(matches!(
        relay.submit_view_job("alice", "https://example.com/watch", 1, None),
        Err(ErrorKind::ShuttingDown)
    ));
}

/// Accepts connections and never answers
async fn black_hole() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn test_shutdown_refuses_jobs_while_refresh_hangs() {
    let hung = black_hole().await;
    let config = Config {
        validator: ValidatorConfig {
            concurrency: 1,
            timeout: Duration::from_secs(8),
            probe_urls: vec![Url::parse("http://probe.test/ip").unwrap()],
            ..ValidatorConfig::default()
        },
        dispatcher: dispatcher_config(1),
        ..Config::default()
    };
    let sources: Vec<Box<dyn ProxySource>> = vec![Box::new(StaticSource::from_lines(
        "static",
        &format!("{hung}\n"),
        Protocol::Http,
    ))];
    let relay = ViewRelay::with_parts(config, sources, Arc::new(SteadyRequester), None).unwrap();
    relay.start_housekeeping();
    // Let the first refresh reach the hung proxy
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, submitted) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(relay.shutdown(Duration::from_millis(100)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            relay.submit_view_job("alice", "https://example.com/watch", 1, None)
        })
    })
    .await
    .expect("shutdown waited for the hung refresh");

    assert!(matches!(submitted, Err(ErrorKind::ShuttingDown)));
    assert!(relay.is_shut_down());
    assert!(relay.limiter().usage(&"alice".into()).is_none());
}

#[tokio::test]
async fn test_invalid_target_is_rejected_before_admission() {
    let relay = ViewRelay::with_parts(
        Config::default(),
        vec![Box::new(StaticSource::default())],
        Arc::new(SteadyRequester),
        None,
    )
    .unwrap();

    assert!(matches!(
        relay.submit_view_job("alice", "not a url", 1, None),
        Err(ErrorKind::ParseUrl(..))
    ));
    assert!(matches!(
        relay.submit_view_job("alice", "https://example.com", 0, None),
        Err(ErrorKind::InvalidJob(_))
    ));
    assert!(relay.limiter().usage(&"alice".into()).is_none());
}

#[tokio::test]
async fn test_dead_proxy_is_not_reingested() {
    let pool = healthy_pool!(1);
    let candidate: ProxyCandidate = "10.0.0.1:8000".parse().unwrap();
    for _ in 0..3 {
        pool.report(&candidate.key(), viewrelay_lib::proxy::Outcome::Failure);
    }
    assert_eq!(pool.get(&candidate.key()).unwrap().state, ProxyState::Dead);

    assert_eq!(pool.ingest([candidate.clone()]), 0);
    assert_eq!(pool.get(&candidate.key()).unwrap().state, ProxyState::Dead);
}
