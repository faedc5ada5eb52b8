//! JMX service URL value type.

use std::fmt;
use std::str::FromStr;

use crate::errors::{BrokerError, BrokerResult};

const SCHEME: &str = "service:jmx:";

/// A parsed `service:jmx:<protocol>://[host[:port]]<url-path>` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JmxServiceUrl {
    protocol: String,
    host: String,
    port: Option<u16>,
    url_path: String,
}

impl JmxServiceUrl {
    pub fn parse(raw: &str) -> BrokerResult<Self> {
        let invalid = |reason: &str| BrokerError::Connection(format!("{}: {:?}", reason, raw));

        let rest = raw
            .get(..SCHEME.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(SCHEME))
            .map(|_| &raw[SCHEME.len()..])
            .ok_or_else(|| invalid("not a service:jmx: URL"))?;

        let (protocol, rest) = rest
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' after protocol"))?;
        if protocol.is_empty()
            || !protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid protocol"));
        }

        let authority_end = rest.find(['/', ';']).unwrap_or(rest.len());
        let (authority, url_path) = rest.split_at(authority_end);

        let (host, port) = split_host_port(authority).ok_or_else(|| invalid("invalid host:port"))?;

        Ok(Self {
            protocol: protocol.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            url_path: url_path.to_string(),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host part; empty means the local host.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    /// Whether the address points at this host.
    pub fn is_local(&self) -> bool {
        matches!(
            self.host.as_str(),
            "" | "localhost" | "127.0.0.1" | "[::1]" | "::1"
        )
    }
}

fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    if authority.is_empty() {
        return Some(("", None));
    }

    // Bracketed IPv6 literal.
    if authority.starts_with('[') {
        let close = authority.find(']')?;
        let host = &authority[..=close];
        let tail = &authority[close + 1..];
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((authority, None)),
    }
}

impl FromStr for JmxServiceUrl {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JmxServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}://{}", SCHEME, self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.url_path)
    }
}
