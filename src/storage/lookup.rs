//! Public address lookup.
//!
//! Sessions opened from a loopback or private address report the public IP
//! returned by an external plain-text service.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{DEFAULT_LOOKUP_TIMEOUT_MS, DEFAULT_LOOKUP_URL};
use crate::error::StoreError;
use crate::traits::AddressLookup;

/// HTTP-backed [`AddressLookup`].
#[derive(Debug, Clone)]
pub struct HttpAddressLookup {
    client: Client,
    url: String,
    timeout_ms: u64,
}

impl HttpAddressLookup {
    /// Create a lookup against `url`, giving up after `timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AddressLookup`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| StoreError::AddressLookup {
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            timeout_ms,
        })
    }

    /// Create a lookup against the default service.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AddressLookup`] if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::new(DEFAULT_LOOKUP_URL, DEFAULT_LOOKUP_TIMEOUT_MS)
    }

    /// Service endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AddressLookup for HttpAddressLookup {
    async fn public_ip(&self) -> Result<String, StoreError> {
        tracing::debug!(url = %self.url, "Resolving public address");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::AddressLookup {
                    message: format!("timed out after {}ms", self.timeout_ms),
                }
            } else {
                StoreError::AddressLookup {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::AddressLookup {
                message: format!("service returned {status}"),
            });
        }

        let body = response.text().await.map_err(|e| StoreError::AddressLookup {
            message: format!("unreadable response: {e}"),
        })?;

        let ip = body.trim();
        if ip.is_empty() {
            return Err(StoreError::AddressLookup {
                message: "empty response".to_string(),
            });
        }
        Ok(ip.to_string())
    }
}

/// Whether a session host needs its public address resolved.
///
/// True for `localhost`, loopback, and private-range addresses.
#[must_use]
pub fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    }
}

const fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    // fc00::/7 unique-local, fe80::/10 link-local
    let first = ip.segments()[0];
    ip.is_loopback() || ip.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
