use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::time::Instant;
use url::Url;

use crate::cache::TtlCache;
use crate::client::ClientBuilder;
use crate::proxy::{ProxyKey, ProxyRecord};
use crate::{ErrorKind, Result};

/// Number of per-proxy clients kept around for reuse
const CLIENT_CACHE_CAPACITY: usize = 256;

/// How long an idle per-proxy client is kept
const CLIENT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Performs one simulated view through a leased proxy.
///
/// The dispatcher only cares whether the view succeeded and how long it
/// took, so tests and embedders can swap the transport freely.
#[async_trait]
pub trait Requester: Send + Sync + Debug {
    /// Load `target` once through `proxy`, returning the round-trip time
    ///
    /// # Errors
    ///
    /// Any error counts as a failed attempt. Errors for which
    /// [`ErrorKind::is_timeout`] holds are reported to the pool as timeouts.
    async fn perform(&self, proxy: &ProxyRecord, target: &Url) -> Result<Duration>;
}

/// Loads the target with a plain GET through the proxy and reads the body.
///
/// Clients are built once per proxy and reused while the proxy stays in use.
#[derive(Debug)]
pub struct HttpRequester {
    client_builder: ClientBuilder,
    clients: TtlCache<ProxyKey, reqwest::Client>,
}

impl Default for HttpRequester {
    fn default() -> Self {
        Self::new(ClientBuilder::default())
    }
}

impl HttpRequester {
    /// Create a requester building its clients with `client_builder`
    #[must_use]
    pub fn new(client_builder: ClientBuilder) -> Self {
        Self {
            client_builder,
            clients: TtlCache::new(CLIENT_CACHE_CAPACITY, CLIENT_CACHE_TTL),
        }
    }

    fn client(&self, proxy: &ProxyRecord) -> Result<reqwest::Client> {
        let key = proxy.key();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client);
        }
        let client = self
            .client_builder
            .client_for(&proxy.candidate())
            .map_err(|e| ErrorKind::AttemptFailure {
                proxy: key.clone(),
                reason: e.to_string(),
            })?;
        self.clients.put(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn perform(&self, proxy: &ProxyRecord, target: &Url) -> Result<Duration> {
        let client = self.client(proxy)?;
        let started = Instant::now();

        let response = client
            .get(target.clone())
            .send()
            .await
            .map_err(|e| self.classify(e, started))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ErrorKind::RejectedStatusCode(status));
        }

        // The view only counts once the page was fully delivered
        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify(e, started))?;
        trace!("{} bytes from {target} via {}", body.len(), proxy.key());

        Ok(started.elapsed())
    }
}

impl HttpRequester {
    fn classify(&self, error: reqwest::Error, started: Instant) -> ErrorKind {
        if error.is_timeout() {
            ErrorKind::AttemptTimeout(self.client_builder.timeout().unwrap_or(started.elapsed()))
        } else if error.is_body() || error.is_decode() {
            ErrorKind::ReadResponseBody(error)
        } else {
            ErrorKind::NetworkRequest(error)
        }
    }
}
