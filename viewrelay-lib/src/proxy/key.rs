use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::ErrorKind;
use crate::types::Result;

/// A type-safe representation of a proxy's identity inside the pool.
///
/// Two proxies are considered the same if they share address and port,
/// regardless of the protocol they were listed with. The address is
/// normalized to lowercase.
///
/// # Examples
///
/// ```
/// use viewrelay_lib::proxy::{ProxyCandidate, ProxyKey};
///
/// let candidate: ProxyCandidate = "socks5://10.0.0.1:1080".parse().unwrap();
/// assert_eq!(candidate.key(), ProxyKey::new("10.0.0.1", 1080));
/// assert_eq!(candidate.key().as_str(), "10.0.0.1:1080");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyKey(String);

impl ProxyKey {
    /// Build a key from an address and a port
    #[must_use]
    pub fn new(address: &str, port: u16) -> Self {
        ProxyKey(format!("{}:{port}", address.to_lowercase()))
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the key as an owned String
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire protocol a proxy speaks
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    /// Plain HTTP proxy
    #[default]
    Http,
    /// HTTP proxy reached over TLS
    Https,
    /// SOCKS version 4
    Socks4,
    /// SOCKS version 5
    Socks5,
}

/// A raw proxy address as delivered by a [`crate::proxy::ProxySource`],
/// before it has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyCandidate {
    /// Hostname or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Protocol used to talk to the proxy
    pub protocol: Protocol,
}

impl ProxyCandidate {
    /// Parse `host:port` or `scheme://host:port`.
    ///
    /// Entries without a scheme are assumed to speak `default_protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidProxy`] if the entry is empty, has an
    /// unknown scheme, or lacks a host or a port.
    pub fn parse(input: &str, default_protocol: Protocol) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| ErrorKind::InvalidProxy(input.to_string(), reason.to_string());

        if input.is_empty() {
            return Err(invalid("empty entry"));
        }

        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("{default_protocol}://{input}"))
        }
        .map_err(|e| invalid(&e.to_string()))?;

        let protocol = Protocol::from_str(url.scheme()).map_err(|_| invalid("unknown scheme"))?;
        let address = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        Ok(ProxyCandidate {
            address: address.to_lowercase(),
            port,
            protocol,
        })
    }

    /// The key used to deduplicate this candidate in the pool
    #[must_use]
    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(&self.address, self.port)
    }

    /// URL suitable for [`reqwest::Proxy::all`]
    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }
}

impl FromStr for ProxyCandidate {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self> {
        ProxyCandidate::parse(s, Protocol::default())
    }
}

impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proxy_url())
    }
}
