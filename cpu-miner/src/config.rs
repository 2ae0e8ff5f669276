//! Configuration management for cpu-miner.
//!
//! This module handles loading and validating configuration from TOML files
//! and environment variables. The orchestration core never reads this state
//! globally: a validated [`Config`] is wrapped in an `Arc` and handed to each
//! component at construction, and a reconfigure replaces the whole snapshot.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::algo::Algorithm;
use crate::error::{Error, Result};
use crate::pool::PoolDescriptor;

/// Largest number of hashes a worker may compute per scratch pass.
pub const MAX_HASH_FACTOR: usize = 5;

/// Largest donation level, in percent.
pub const MAX_DONATE_LEVEL: u8 = 99;

/// Main configuration structure for the miner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Upstream pools in priority order (first = highest priority)
    pub pools: Vec<PoolConfig>,

    /// Default algorithm for pools that don't name one
    #[serde(default)]
    pub algo: Algorithm,

    /// Percentage of mining time diverted to the donation pool
    #[serde(default = "default_donate_level")]
    pub donate_level: u8,

    /// Worker thread configuration
    #[serde(default)]
    pub threads: ThreadConfig,

    /// Scratch memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Pool networking configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Donation pool configuration
    #[serde(default)]
    pub donation: DonationConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Share rejection health monitoring
    #[serde(default)]
    pub health: HealthConfig,

    /// Command-and-control endpoint (status consumer)
    #[serde(default)]
    pub cc: Option<CcConfig>,
}

/// Pool connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port, stratum+ssl://host:port or host:port)
    pub url: String,

    /// Login, usually a wallet address with optional worker suffix
    pub user: String,

    /// Password
    #[serde(default = "default_password")]
    pub pass: String,

    /// Use TLS (also implied by a `stratum+ssl://` or `stratum+tls://` URL)
    #[serde(default)]
    pub tls: bool,

    /// Send keep-alive messages when idle
    #[serde(default)]
    pub keepalive: bool,

    /// Pool owns the top nonce byte (NiceHash-style)
    #[serde(default)]
    pub nicehash: bool,

    /// Algorithm override for this pool
    #[serde(default)]
    pub algo: Option<Algorithm>,
}

/// How many worker threads to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ThreadCount {
    /// Exactly this many workers
    Fixed(usize),
    /// Derived from the CPU
    Mode(ThreadMode),
}

/// Automatic thread count policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// One worker per logical core
    All,
    /// Sized so that all working sets fit in L3
    Auto,
}

impl Default for ThreadCount {
    fn default() -> Self {
        ThreadCount::Mode(ThreadMode::All)
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadConfig {
    /// Number of workers
    #[serde(default)]
    pub count: ThreadCount,

    /// CPU affinity mask; worker N is pinned to the N-th set bit
    #[serde(default)]
    pub affinity: Option<u64>,

    /// Hashes per scratch pass for multi-hash threads
    #[serde(default = "default_hash_factor")]
    pub hash_factor: usize,

    /// Which workers use `hash_factor` (bit N = worker N); all when unset
    #[serde(default)]
    pub multi_hash_thread_mask: Option<u64>,

    /// Per-worker overrides, winning over the settings above
    #[serde(default)]
    pub overrides: Vec<ThreadOverride>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            count: ThreadCount::default(),
            affinity: None,
            hash_factor: default_hash_factor(),
            multi_hash_thread_mask: None,
            overrides: Vec::new(),
        }
    }
}

/// Override for a single worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadOverride {
    /// Worker index
    pub index: usize,

    /// Pin to this logical CPU
    #[serde(default)]
    pub cpu: Option<usize>,

    /// Hash factor for this worker
    #[serde(default)]
    pub hash_factor: Option<usize>,
}

/// Scratch memory configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Try huge pages before falling back to the regular heap
    #[serde(default = "default_true")]
    pub huge_pages: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { huge_pages: true }
    }
}

/// What to do with a share whose job has been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleSharePolicy {
    /// Discard locally, never send
    #[default]
    Drop,
    /// Send with the dialect's stale marker
    Submit,
}

/// Which wire dialect to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// CryptoNote-style `login` / `job` / `submit`
    #[default]
    Login,
    /// `mining.subscribe` / `mining.authorize` / `mining.notify`
    Stratum,
}

/// Method names for the login dialect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MethodNames {
    #[serde(default = "default_login_method")]
    pub login: String,
    #[serde(default = "default_job_method")]
    pub job: String,
    #[serde(default = "default_submit_method")]
    pub submit: String,
    #[serde(default = "default_keepalive_method")]
    pub keepalive: String,
}

impl Default for MethodNames {
    fn default() -> Self {
        Self {
            login: default_login_method(),
            job: default_job_method(),
            submit: default_submit_method(),
            keepalive: default_keepalive_method(),
        }
    }
}

/// Pool networking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// First reconnect delay, in milliseconds
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,

    /// Reconnect delay ceiling, in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Consecutive failures before a connection is reported Failed
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Bound on the TCP connect step
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on any request/response round trip (subscribe, authorize, submit, keep-alive)
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Idle time before a keep-alive is sent
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Stale share handling
    #[serde(default)]
    pub stale_shares: StaleSharePolicy,

    /// Switch back to a higher-priority pool as soon as it is ready
    #[serde(default)]
    pub prefer_primary: bool,

    /// Wire dialect
    #[serde(default)]
    pub dialect: DialectKind,

    /// Method names (login dialect)
    #[serde(default)]
    pub methods: MethodNames,

    /// User agent reported at login
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_failures: default_max_failures(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            stale_shares: StaleSharePolicy::default(),
            prefer_primary: false,
            dialect: DialectKind::default(),
            methods: MethodNames::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    pub fn retry_min(&self) -> Duration {
        Duration::from_millis(self.retry_min_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Donation pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DonationConfig {
    /// Donation pool URL; donation is disabled when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Login used on the donation pool
    #[serde(default = "default_donation_user")]
    pub user: String,

    /// Length of one donation time unit in seconds (a cycle is 100 units)
    #[serde(default = "default_donation_unit_secs")]
    pub unit_secs: u64,
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: default_donation_user(),
            unit_secs: default_donation_unit_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// ANSI colours on stdout
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Interval between hashrate reports, in seconds (0 disables)
    #[serde(default = "default_print_time_secs")]
    pub print_time_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            colors: true,
            print_time_secs: default_print_time_secs(),
        }
    }
}

/// Share rejection health monitoring.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Number of most recent share results considered
    #[serde(default = "default_rejection_window")]
    pub rejection_window: usize,

    /// Rejected fraction above which mining is reported unhealthy
    #[serde(default = "default_max_rejection_ratio")]
    pub max_rejection_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            rejection_window: default_rejection_window(),
            max_rejection_ratio: default_max_rejection_ratio(),
        }
    }
}

/// Command-and-control endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CcConfig {
    /// Endpoint URL
    pub url: String,

    /// Status publication interval, in seconds
    #[serde(default = "default_cc_update_secs")]
    pub update_interval_secs: u64,
}

impl CcConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

fn default_donate_level() -> u8 {
    1
}
fn default_password() -> String {
    "x".to_string()
}
fn default_hash_factor() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_retry_min_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    60_000
}
fn default_max_failures() -> u32 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_response_timeout_ms() -> u64 {
    30_000
}
fn default_keepalive_secs() -> u64 {
    60
}
fn default_login_method() -> String {
    "login".to_string()
}
fn default_job_method() -> String {
    "job".to_string()
}
fn default_submit_method() -> String {
    "submit".to_string()
}
fn default_keepalive_method() -> String {
    "keepalived".to_string()
}
fn default_user_agent() -> String {
    concat!("cpu-miner/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_donation_user() -> String {
    "donation".to_string()
}
fn default_donation_unit_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_print_time_secs() -> u64 {
    60
}
fn default_rejection_window() -> usize {
    100
}
fn default_max_rejection_ratio() -> f64 {
    0.5
}
fn default_cc_update_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text, apply environment overrides and
    /// validate the result.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the environment.
    ///
    /// - `CPUMINER_THREADS`: fixed worker count
    /// - `CPUMINER_DONATE_LEVEL`: donation percentage
    pub fn apply_env_overrides(&mut self) {
        if let Some(count) = std::env::var("CPUMINER_THREADS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.threads.count = ThreadCount::Fixed(count);
        }

        if let Some(level) = std::env::var("CPUMINER_DONATE_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.donate_level = level;
        }
    }

    /// Check the configuration for errors that must stop startup.
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::Config("no pools configured".to_string()));
        }

        for pool in &self.pools {
            if pool.user.is_empty() {
                return Err(Error::Config(format!("pool {} has no user", pool.url)));
            }
            PoolDescriptor::from_config(pool, self.algo)?;
        }

        if self.threads.count == ThreadCount::Fixed(0) {
            return Err(Error::Config("thread count must be at least 1".to_string()));
        }

        if self.donate_level > MAX_DONATE_LEVEL {
            return Err(Error::Config(format!(
                "donate_level {} exceeds {}",
                self.donate_level, MAX_DONATE_LEVEL
            )));
        }

        let factors = std::iter::once(self.threads.hash_factor).chain(
            self.threads
                .overrides
                .iter()
                .filter_map(|o| o.hash_factor),
        );
        for factor in factors {
            if factor == 0 || factor > MAX_HASH_FACTOR {
                return Err(Error::Config(format!(
                    "hash_factor {} outside 1..={}",
                    factor, MAX_HASH_FACTOR
                )));
            }
        }

        if self.threads.affinity == Some(0) {
            return Err(Error::Config("affinity mask selects no CPUs".to_string()));
        }

        if self.network.retry_min_ms == 0 || self.network.retry_min_ms > self.network.retry_max_ms {
            return Err(Error::Config(format!(
                "invalid retry bounds {}..{} ms",
                self.network.retry_min_ms, self.network.retry_max_ms
            )));
        }

        if self.network.max_failures == 0 {
            return Err(Error::Config("max_failures must be at least 1".to_string()));
        }

        if self.donation.unit_secs == 0 {
            return Err(Error::Config("donation unit_secs must be positive".to_string()));
        }

        if let Some(url) = &self.donation.url {
            let donation = PoolConfig {
                url: url.clone(),
                user: self.donation.user.clone(),
                pass: default_password(),
                tls: false,
                keepalive: true,
                nicehash: false,
                algo: None,
            };
            PoolDescriptor::from_config(&donation, self.algo)?;
        }

        if self.cc.as_ref().is_some_and(|cc| cc.update_interval_secs == 0) {
            return Err(Error::Config(
                "cc update_interval_secs must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.health.max_rejection_ratio) {
            return Err(Error::Config(
                "max_rejection_ratio must be within 0.0..=1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Descriptors for the configured pools, in priority order.
    pub fn pool_descriptors(&self) -> Result<Vec<PoolDescriptor>> {
        self.pools
            .iter()
            .map(|p| PoolDescriptor::from_config(p, self.algo))
            .collect()
    }

    /// Synthetic descriptor for the donation pool, when donation is enabled.
    pub fn donation_descriptor(&self) -> Result<Option<PoolDescriptor>> {
        if self.donate_level == 0 {
            return Ok(None);
        }
        let Some(url) = &self.donation.url else {
            return Ok(None);
        };
        // Donation mirrors the primary pool's algorithm so workers keep
        // their scratch buffers.
        let algo = self
            .pools
            .first()
            .and_then(|p| p.algo)
            .unwrap_or(self.algo);
        let pool = PoolConfig {
            url: url.clone(),
            user: self.donation.user.clone(),
            pass: default_password(),
            tls: false,
            keepalive: true,
            nicehash: false,
            algo: Some(algo),
        };
        PoolDescriptor::from_config(&pool, self.algo).map(Some)
    }

    /// Hash factor for worker `index`.
    pub fn thread_hash_factor(&self, index: usize) -> usize {
        if let Some(factor) = self
            .threads
            .overrides
            .iter()
            .find(|o| o.index == index)
            .and_then(|o| o.hash_factor)
        {
            return factor;
        }

        match self.threads.multi_hash_thread_mask {
            Some(mask) if index >= 64 || mask & (1u64 << index) == 0 => 1,
            _ => self.threads.hash_factor,
        }
    }

    /// Explicit CPU override for worker `index`, if any.
    pub fn thread_cpu_override(&self, index: usize) -> Option<usize> {
        self.threads
            .overrides
            .iter()
            .find(|o| o.index == index)
            .and_then(|o| o.cpu)
    }
}
