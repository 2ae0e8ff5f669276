//! Pool endpoint descriptors.

use std::fmt;

use crate::algo::Algorithm;
use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Everything needed to reach and log into one upstream pool.
///
/// Immutable once built; one per configured pool plus one synthetic
/// descriptor for the donation pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescriptor {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: String,
    pub password: String,
    pub keepalive: bool,
    pub algo: Algorithm,
    pub nicehash: bool,
}

impl PoolDescriptor {
    /// Build a descriptor from pool configuration.
    ///
    /// Accepts `stratum+tcp://`, `stratum+ssl://`, `stratum+tls://`,
    /// `tcp://` or scheme-less `host:port` URLs. An SSL/TLS scheme sets the
    /// TLS flag; so does `tls = true` in the configuration.
    pub fn from_config(pool: &PoolConfig, default_algo: Algorithm) -> Result<Self> {
        let (host, port, tls_scheme) = parse_url(&pool.url)?;
        Ok(Self {
            host,
            port,
            tls: pool.tls || tls_scheme,
            user: pool.user.clone(),
            password: pool.pass.clone(),
            keepalive: pool.keepalive,
            algo: pool.algo.unwrap_or(default_algo),
            nicehash: pool.nicehash,
        })
    }

    /// `host:port` form used for TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_url(url: &str) -> Result<(String, u16, bool)> {
    let (rest, tls) = if let Some(rest) = url
        .strip_prefix("stratum+ssl://")
        .or_else(|| url.strip_prefix("stratum+tls://"))
    {
        (rest, true)
    } else if let Some(rest) = url
        .strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
    {
        (rest, false)
    } else if url.contains("://") {
        return Err(Error::Config(format!("unsupported pool URL scheme: {}", url)));
    } else {
        (url, false)
    };

    let rest = rest.trim_end_matches('/');
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("pool URL has no port: {}", url)))?;

    if host.is_empty() {
        return Err(Error::Config(format!("pool URL has no host: {}", url)));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in pool URL: {}", url)))?;
    if port == 0 {
        return Err(Error::Config(format!("invalid port in pool URL: {}", url)));
    }

    Ok((host.to_string(), port, tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pool(url: &str) -> PoolConfig {
        PoolConfig {
            url: url.to_string(),
            user: "wallet".to_string(),
            pass: "x".to_string(),
            tls: false,
            keepalive: false,
            nicehash: false,
            algo: None,
        }
    }

    #[test_case("stratum+tcp://pool.example.com:3333", "pool.example.com", 3333, false)]
    #[test_case("stratum+ssl://pool.example.com:443", "pool.example.com", 443, true)]
    #[test_case("stratum+tls://pool.example.com:443/", "pool.example.com", 443, true)]
    #[test_case("tcp://10.0.0.1:5555", "10.0.0.1", 5555, false)]
    #[test_case("pool.example.com:7777", "pool.example.com", 7777, false)]
    fn parses_urls(url: &str, host: &str, port: u16, tls: bool) {
        let desc = PoolDescriptor::from_config(&pool(url), Algorithm::Cryptonight).unwrap();
        assert_eq!(desc.host, host);
        assert_eq!(desc.port, port);
        assert_eq!(desc.tls, tls);
    }

    #[test_case("http://pool.example.com:80"; "unsupported scheme")]
    #[test_case("pool.example.com"; "missing port")]
    #[test_case(":3333"; "missing host")]
    #[test_case("pool.example.com:notaport"; "bad port")]
    #[test_case("pool.example.com:0"; "zero port")]
    fn rejects_bad_urls(url: &str) {
        assert!(PoolDescriptor::from_config(&pool(url), Algorithm::Cryptonight).is_err());
    }

    #[test]
    fn tls_flag_from_config() {
        let mut cfg = pool("pool.example.com:3333");
        cfg.tls = true;
        let desc = PoolDescriptor::from_config(&cfg, Algorithm::Cryptonight).unwrap();
        assert!(desc.tls);
        assert_eq!(desc.address(), "pool.example.com:3333");
    }
}
