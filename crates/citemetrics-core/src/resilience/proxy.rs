//! Ordered proxy chain for requests that must survive IP-based blocking.
//!
//! The chain is the preferred anonymizing proxy repeated `tor_repeats`
//! times, then every secondary SOCKS5 proxy once. Order is fixed at
//! construction and failover walks it front to back.

use std::fmt;

/// One hop in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyEndpoint {
    /// No proxy.
    Direct,
    /// A proxy URL (`http://`, `socks5://`, ...). `label` never contains credentials.
    Proxy { url: String, label: String },
}

impl ProxyEndpoint {
    pub fn proxy(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Proxy {
            url: url.into(),
            label: label.into(),
        }
    }

    /// Log-safe name of the endpoint.
    pub fn label(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Proxy { label, .. } => label,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Direct => None,
            Self::Proxy { url, .. } => Some(url),
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyChain {
    endpoints: Vec<ProxyEndpoint>,
}

impl ProxyChain {
    /// A chain with no proxies; requests go out directly.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn new(tor_proxy: Option<&str>, tor_repeats: usize, secondaries: Vec<ProxyEndpoint>) -> Self {
        let mut endpoints = Vec::new();
        if let Some(tor) = tor_proxy.map(str::trim).filter(|t| !t.is_empty()) {
            let url = tor.trim_end_matches('/').to_string();
            let url = if url.contains("://") {
                url
            } else {
                format!("http://{url}")
            };
            for _ in 0..tor_repeats {
                endpoints.push(ProxyEndpoint::proxy(url.clone(), "tor"));
            }
        }
        endpoints.extend(secondaries);
        Self { endpoints }
    }

    /// Build from the raw `TOR_PROXY` / `SOCKS5_PROXIES` values.
    pub fn from_settings(tor_proxy: Option<&str>, tor_repeats: usize, socks5: Option<&str>) -> Self {
        let secondaries = socks5.map(parse_socks5_proxies).unwrap_or_default();
        Self::new(tor_proxy, tor_repeats, secondaries)
    }

    /// Endpoints to try, in order. Never empty: an unconfigured chain is `[Direct]`.
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        if self.endpoints.is_empty() {
            vec![ProxyEndpoint::Direct]
        } else {
            self.endpoints.clone()
        }
    }

    pub fn is_direct(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Parse `host:port|user|pass` entries separated by `;` or newlines.
///
/// The password may itself contain `|`. User and password are
/// percent-encoded into the proxy URL. Blank entries are skipped.
pub fn parse_socks5_proxies(raw: &str) -> Vec<ProxyEndpoint> {
    raw.split([';', '\n'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(3, '|');
            let host = parts.next()?.trim();
            if host.is_empty() {
                return None;
            }
            let user = parts.next().map(str::trim).filter(|u| !u.is_empty());
            let pass = parts.next().unwrap_or("");
            let url = match user {
                Some(user) => format!(
                    "socks5://{}:{}@{}",
                    urlencoding::encode(user),
                    urlencoding::encode(pass),
                    host
                ),
                None => format!("socks5://{host}"),
            };
            Some(ProxyEndpoint::proxy(url, format!("socks5:{host}")))
        })
        .collect()
}
