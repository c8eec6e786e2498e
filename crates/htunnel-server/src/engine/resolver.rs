//! Host name resolution for `Connect` messages.
//!
//! Resolution sits behind the [`Resolve`] trait so the stream manager does not
//! care where addresses come from. [`DnsResolver`] is the system resolver via
//! `tokio::net::lookup_host`.

use std::future::Future;
use std::net::IpAddr;
use tokio::net;
use tracing::{debug, warn};

/// Resolves a host name to a single IP address.
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `host`, returning a human-readable reason on failure.
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr, String>> + Send;
}

/// Stateless system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl Resolve for DnsResolver {
    /// IP literals are returned as-is. Otherwise the first IPv4 address is
    /// preferred, falling back to the first address of any family.
    ///
    /// A dummy port (`:0`) is appended internally because `lookup_host`
    /// requires a `host:port` pair.
    async fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = match net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                warn!(host = %host, error = %e, "DNS resolution failed");
                return Err(format!("DNS resolution failed for {host}: {e}"));
            }
        };

        let chosen = addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied();

        match chosen {
            Some(ip) => {
                debug!(host = %host, ip = %ip, count = addrs.len(), "resolved");
                Ok(ip)
            }
            None => Err(format!("no addresses found for {host}")),
        }
    }
}

/// Fixed host table, for tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: std::collections::HashMap<String, IpAddr>,
}

#[cfg(test)]
impl StaticResolver {
    pub fn with(mut self, host: &str, ip: IpAddr) -> Self {
        self.hosts.insert(host.to_string(), ip);
        self
    }
}

#[cfg(test)]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| format!("unknown host {host}"))
    }
}
