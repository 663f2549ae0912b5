use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;

/// The configuration record the proxy core consumes.  Assembled from
/// built-in defaults, an optional JSON config file and the command
/// line, in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// IPv4 address to listen for DNS queries on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// UDP port to listen for DNS queries on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Seconds to wait for an upstream response; 0 disables query
    /// expiration.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Cap on forwarded queries in flight; with 0 only the 16-bit
    /// query ID space limits it.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Cap on upstream sockets; 0 is uncapped.
    #[serde(default = "default_max_ports")]
    pub max_ports: u32,
    /// Queries forwarded through one socket before it is retired;
    /// 0 reuses sockets forever.
    #[serde(default = "default_max_port_lifetime")]
    pub max_port_lifetime: u32,
    /// Garbage-collection coalescing interval in seconds; 0 expires
    /// requests exactly on time.
    #[serde(default = "default_min_gc_time")]
    pub min_gc_time: u64,
    /// PRNG seed for reproducing a previous run; 0 seeds from the
    /// wall clock.
    #[serde(default)]
    pub rng_seed: u64,
    /// Verbose logging and extra internal sanity checks.
    #[serde(default)]
    pub debug: bool,
    /// IPv4 address of the upstream DNS server.  Required.
    #[serde(default)]
    pub upstream_address: String,
    /// UDP port of the upstream DNS server.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            request_timeout: default_request_timeout(),
            max_requests: default_max_requests(),
            max_ports: default_max_ports(),
            max_port_lifetime: default_max_port_lifetime(),
            min_gc_time: default_min_gc_time(),
            rng_seed: 0,
            debug: false,
            upstream_address: String::new(),
            upstream_port: default_upstream_port(),
        }
    }
}

impl ProxyConfig {
    /// Validate the addresses and produce the listening and upstream
    /// endpoints.
    pub fn resolve(&self) -> Result<(SocketAddr, SocketAddr)> {
        let listen: Ipv4Addr = self
            .listen_address
            .parse()
            .with_context(|| format!("{}: invalid IPv4 address", self.listen_address))?;

        if self.upstream_address.is_empty() {
            anyhow::bail!("the upstream DNS server address is required");
        }
        let upstream: Ipv4Addr = self
            .upstream_address
            .parse()
            .with_context(|| format!("{}: invalid IPv4 address", self.upstream_address))?;

        Ok((
            SocketAddr::from(SocketAddrV4::new(listen, self.listen_port)),
            SocketAddr::from(SocketAddrV4::new(upstream, self.upstream_port)),
        ))
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    Ok(cfg)
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_requests() -> u32 {
    250
}

fn default_max_ports() -> u32 {
    50
}

fn default_max_port_lifetime() -> u32 {
    10
}

fn default_min_gc_time() -> u64 {
    5
}

fn default_upstream_port() -> u16 {
    53
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: ProxyConfig = serde_json::from_value(json!({
            "upstream_address": "9.9.9.9"
        }))
        .expect("parse config");

        assert_eq!(cfg.listen_address, "127.0.0.1");
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.request_timeout, 15);
        assert_eq!(cfg.max_requests, 250);
        assert_eq!(cfg.max_ports, 50);
        assert_eq!(cfg.max_port_lifetime, 10);
        assert_eq!(cfg.min_gc_time, 5);
        assert_eq!(cfg.rng_seed, 0);
        assert!(!cfg.debug);
        assert_eq!(cfg.upstream_port, 53);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: std::result::Result<ProxyConfig, _> = serde_json::from_value(json!({
            "upstream_address": "9.9.9.9",
            "max_port": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn resolve_produces_both_endpoints() {
        let cfg = ProxyConfig {
            upstream_address: "192.0.2.1".into(),
            upstream_port: 5353,
            ..ProxyConfig::default()
        };
        let (listen, upstream) = cfg.resolve().unwrap();
        assert_eq!(listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(upstream, "192.0.2.1:5353".parse().unwrap());
    }

    #[test]
    fn resolve_requires_an_upstream_address() {
        let cfg = ProxyConfig::default();
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn resolve_rejects_a_hostname() {
        let cfg = ProxyConfig {
            upstream_address: "dns.example.net".into(),
            ..ProxyConfig::default()
        };
        assert!(cfg.resolve().is_err());
    }
}
