//! `viewrelay` dispatches simulated views of a target URL through a rotating
//! pool of third-party proxies, under per-actor rate limits.
//!
//! The pieces can be used on their own, but most callers want the
//! [`ViewRelay`] facade, which wires them together:
//!
//! ```no_run
//! use std::time::Duration;
//! use viewrelay_lib::{Config, Result, ViewRelay};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let relay = ViewRelay::init(Config::default())?;
//!   relay.force_proxy_refresh().await;
//!
//!   let handle = relay.submit_view_job("alice", "https://example.com/watch", 10, Some(Duration::from_secs(30)))?;
//!   let result = handle.result().await?;
//!   println!("{:?}: {} succeeded, {} failed", result.state, result.succeeded_count, result.failed_count);
//!
//!   relay.shutdown(Duration::from_secs(10)).await;
//!   Ok(())
//! }
//! ```
//!
//! For finer control, combine a [`proxy::ProxyPool`], a
//! [`ratelimit::RateLimiter`] and a [`Dispatcher`] yourself. The
//! [`Requester`] trait lets you replace the HTTP transport, e.g. in tests.

mod cache;
mod client;
mod config;
mod relay;
mod replenish;
mod retry;
mod types;

pub mod dispatcher;
pub mod proxy;
pub mod ratelimit;

pub use crate::{
    cache::TtlCache,
    client::{ClientBuilder, DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT},
    config::Config,
    dispatcher::{
        AttemptTelemetry, DispatchEvent, Dispatcher, DispatcherConfig, HttpRequester, JobHandle,
        Requester,
    },
    relay::ViewRelay,
    replenish::{RefreshReport, Replenisher},
    types::*,
};
