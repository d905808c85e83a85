use std::time::Duration;

use http::header::{self, HeaderMap, HeaderValue};
use typed_builder::TypedBuilder;

use crate::proxy::ProxyCandidate;
use crate::{ErrorKind, Result};

/// Default number of redirects followed by a simulated request
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
/// Default timeout of a single request through a proxy
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Default user agent sent with every request
pub const DEFAULT_USER_AGENT: &str = concat!("viewrelay/", env!("CARGO_PKG_VERSION"));

/// Builds [`reqwest::Client`]s that route all traffic through one proxy.
///
/// Both the validator and the dispatcher's HTTP requester use it, so probes
/// and simulated views go out with the same headers.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
pub struct ClientBuilder {
    /// User agent sent with every request
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,

    /// Overall request timeout.
    ///
    /// `None` leaves timing to the caller, e.g. via `tokio::time::timeout`.
    #[builder(default = Some(DEFAULT_TIMEOUT))]
    timeout: Option<Duration>,

    /// Maximum number of redirects to follow
    #[builder(default = DEFAULT_MAX_REDIRECTS)]
    max_redirects: usize,

    /// Extra headers sent with every request
    custom_headers: HeaderMap,
}

impl Default for ClientBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientBuilder {
    /// The configured request timeout
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Create a client whose requests all go through `proxy`
    ///
    /// # Errors
    ///
    /// Returns an error if the user agent is not a valid header value, the
    /// proxy URL is rejected, or the underlying client cannot be built.
    pub fn client_for(&self, proxy: &ProxyCandidate) -> Result<reqwest::Client> {
        let mut headers = self.custom_headers.clone();
        headers.insert(header::USER_AGENT, HeaderValue::from_str(&self.user_agent)?);

        let proxy =
            reqwest::Proxy::all(proxy.proxy_url()).map_err(ErrorKind::BuildRequestClient)?;

        let builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .default_headers(headers)
            .proxy(proxy)
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects));

        (match self.timeout {
            Some(t) => builder.timeout(t),
            None => builder,
        })
        .build()
        .map_err(ErrorKind::BuildRequestClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_builder() {
        let builder = ClientBuilder::default();
        assert_eq!(builder.timeout(), Some(DEFAULT_TIMEOUT));
        assert!(
            builder
                .client_for(&"10.0.0.1:8080".parse().unwrap())
                .is_ok()
        );
    }

    #[test]
    fn test_socks_proxy_client() {
        let builder = ClientBuilder::builder().timeout(None).build();
        assert_eq!(builder.timeout(), None);
        assert!(
            builder
                .client_for(&"socks5://10.0.0.1:1080".parse().unwrap())
                .is_ok()
        );
    }

    #[test]
    fn test_invalid_user_agent() {
        let builder = ClientBuilder::builder().user_agent("bad\nagent").build();
        assert!(matches!(
            builder.client_for(&"10.0.0.1:8080".parse().unwrap()),
            Err(ErrorKind::InvalidHeader(_))
        ));
    }
}
