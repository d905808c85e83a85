use std::fmt::Debug;

use async_trait::async_trait;
use log::{trace, warn};
use url::Url;

use crate::client::DEFAULT_USER_AGENT;
use crate::proxy::{Protocol, ProxyCandidate, SourceConfig};
use crate::{ErrorKind, Result};

/// Somewhere proxy candidates come from
#[async_trait]
pub trait ProxySource: Send + Sync + Debug {
    /// Human-readable name used in logs
    fn name(&self) -> String;

    /// Fetch the current list of candidates
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be retrieved. Malformed entries
    /// are skipped, not reported.
    async fn fetch(&self) -> Result<Vec<ProxyCandidate>>;
}

/// A plain-text list served over HTTP, one `host:port` per line
#[derive(Debug, Clone)]
pub struct HttpListSource {
    url: Url,
    protocol: Protocol,
    limit: usize,
    client: reqwest::Client,
}

impl HttpListSource {
    /// Create a source from its configuration
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BuildRequestClient`] if the HTTP client cannot be
    /// created.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(ErrorKind::BuildRequestClient)?;
        Ok(Self::with_client(config, client))
    }

    /// Create a source that downloads with the given client
    #[must_use]
    pub fn with_client(config: &SourceConfig, client: reqwest::Client) -> Self {
        Self {
            url: config.url.clone(),
            protocol: config.protocol,
            limit: config.limit,
            client,
        }
    }
}

#[async_trait]
impl ProxySource for HttpListSource {
    fn name(&self) -> String {
        self.url.to_string()
    }

    async fn fetch(&self) -> Result<Vec<ProxyCandidate>> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(ErrorKind::NetworkRequest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ErrorKind::RejectedStatusCode(status));
        }

        let body = response.text().await.map_err(ErrorKind::ReadResponseBody)?;
        Ok(parse_list(&body, self.protocol, self.limit))
    }
}

/// A fixed list of candidates, e.g. read from a file
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    name: String,
    candidates: Vec<ProxyCandidate>,
}

impl StaticSource {
    /// Create a source that always returns `candidates`
    #[must_use]
    pub fn new(name: impl Into<String>, candidates: Vec<ProxyCandidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    /// Parse a list with one entry per line, skipping malformed lines
    #[must_use]
    pub fn from_lines(name: impl Into<String>, lines: &str, protocol: Protocol) -> Self {
        Self::new(name, parse_list(lines, protocol, usize::MAX))
    }

    /// Number of candidates this source serves
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether the source serves nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl ProxySource for StaticSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self) -> Result<Vec<ProxyCandidate>> {
        Ok(self.candidates.clone())
    }
}

/// Parse up to `limit` valid entries.
///
/// Blank lines and `#` comments are ignored; invalid entries are logged and
/// skipped without counting towards the limit.
fn parse_list(body: &str, protocol: Protocol, limit: usize) -> Vec<ProxyCandidate> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyCandidate::parse(line, protocol) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                trace!("Skipping list entry: {e}");
                None
            }
        })
        .take(limit)
        .collect()
}

/// Fetch from every source, logging and skipping the ones that fail
pub async fn fetch_all(sources: &[Box<dyn ProxySource>]) -> Vec<ProxyCandidate> {
    let fetches = sources.iter().map(|source| async move {
        match source.fetch().await {
            Ok(candidates) => {
                trace!("{} candidates from {}", candidates.len(), source.name());
                candidates
            }
            Err(e) => {
                warn!("Failed to fetch proxies from {}: {e}", source.name());
                Vec::new()
            }
        }
    });
    futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn list_config(server: &MockServer, limit: usize) -> SourceConfig {
        SourceConfig {
            url: Url::parse(&format!("{}/api/v1/get?type=socks5", server.uri())).unwrap(),
            protocol: Protocol::Socks5,
            limit,
        }
    }

    #[test]
    fn test_parse_list_skips_garbage() {
        let body = "10.0.0.1:1080\r\n\r\n# comment\r\nnot a proxy\r\n10.0.0.2:1080\r\n";
        let candidates = parse_list(body, Protocol::Http, 10);
        assert_eq!(
            candidates,
            vec![
                "10.0.0.1:1080".parse().unwrap(),
                "10.0.0.2:1080".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_http_list_respects_limit() {
        let server = MockServer::start().await;
        let body: String = (1..=50).map(|i| format!("10.0.0.{i}:1080\r\n")).collect();
        Mock::given(method("GET"))
            .and(path("/api/v1/get"))
            .and(query_param("type", "socks5"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let source = HttpListSource::new(&list_config(&server, 30)).unwrap();
        let candidates = source.fetch().await.unwrap();

        assert_eq!(candidates.len(), 30);
        assert!(candidates.iter().all(|c| c.protocol == Protocol::Socks5));
        assert_eq!(candidates[0].key().as_str(), "10.0.0.1:1080");
    }

    #[tokio::test]
    async fn test_http_list_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpListSource::new(&list_config(&server, 30)).unwrap();
        assert!(matches!(
            source.fetch().await,
            Err(ErrorKind::RejectedStatusCode(status)) if status.as_u16() == 503
        ));
    }

    #[tokio::test]
    async fn test_fetch_all_skips_failing_sources() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sources: Vec<Box<dyn ProxySource>> = vec![
            Box::new(HttpListSource::new(&list_config(&server, 30)).unwrap()),
            Box::new(StaticSource::from_lines(
                "file",
                "10.0.0.1:8080\n10.0.0.2:8080\n",
                Protocol::Http,
            )),
        ];

        let candidates = fetch_all(&sources).await;
        assert_eq!(candidates.len(), 2);
    }
}
