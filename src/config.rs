//! Configuration management for the VFS cache proxy

use crate::error::{ProxyError, Result};
use crate::pacer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Address the HTTP server binds to (default: 0.0.0.0:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Path prefix the proxy answers on (default: /stream)
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Drop the query string before computing cache keys
    #[serde(default)]
    pub strip_query: bool,

    /// Drop scheme, host, user-info and fragment before computing cache keys
    #[serde(default)]
    pub strip_domain: bool,

    /// Number of two-character directory levels in virtual paths (default: 1)
    #[serde(default = "default_shard_level")]
    pub shard_level: usize,

    /// Maximum retries for upstream calls (default: 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Minimum spacing between upstream calls in milliseconds (default: 10)
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_ms: u64,

    /// Maximum backoff between upstream calls in milliseconds (default: 2000)
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,

    /// Upstream connect timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Chunk cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Whether chunks are kept after being served
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Keep chunks in memory and on disk
    #[default]
    Full,
    /// Fetch every read from upstream
    Off,
}

/// Configuration for the chunk cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Directory for on-disk chunks (default: <tmp>/vfscache-proxy)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Lifetime of cached chunks in seconds (default: 3600)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Bound on on-disk chunk bytes; unbounded when absent
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Bound on in-memory chunk bytes (default: 256MB)
    #[serde(default = "default_memory_size_bytes")]
    pub memory_size_bytes: usize,

    /// Size of each cached chunk in bytes (default: 8MB)
    /// Valid range: 64KB to 256MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Chunks fetched concurrently per read (default: 2)
    #[serde(default = "default_chunk_streams")]
    pub chunk_streams: usize,

    /// How long stat results are remembered in seconds; 0 disables (default: 0)
    #[serde(default)]
    pub dir_cache_time_secs: u64,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_mount_path() -> String {
    "/stream".to_string()
}

fn default_shard_level() -> usize {
    1
}

fn default_max_retries() -> usize {
    10
}

fn default_min_sleep_ms() -> u64 {
    10
}

fn default_max_sleep_ms() -> u64 {
    2000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("vfscache-proxy")
}

fn default_max_age_secs() -> u64 {
    3600 // 1 hour
}

fn default_memory_size_bytes() -> usize {
    256 * 1024 * 1024 // 256MB
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_chunk_streams() -> usize {
    2
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_mode: CacheMode::default(),
            cache_dir: default_cache_dir(),
            max_age_secs: default_max_age_secs(),
            max_size_bytes: None,
            memory_size_bytes: default_memory_size_bytes(),
            chunk_size: default_chunk_size(),
            chunk_streams: default_chunk_streams(),
            dir_cache_time_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration
    ///
    /// # Validation Rules
    /// - chunk_size must be between 64KB and 256MB
    /// - chunk_streams must be > 0
    /// - max_age_secs must be > 0 when caching
    pub fn validate(&self) -> Result<()> {
        const MIN_CHUNK_SIZE: u64 = 64 * 1024; // 64KB
        const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024; // 256MB

        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ProxyError::ConfigError(format!(
                "chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_CHUNK_SIZE / 1024,
                MAX_CHUNK_SIZE / (1024 * 1024),
                self.chunk_size
            )));
        }

        if self.chunk_streams == 0 {
            return Err(ProxyError::ConfigError(
                "chunk_streams must be greater than 0".to_string(),
            ));
        }

        if self.cache_mode == CacheMode::Full && self.max_age_secs == 0 {
            return Err(ProxyError::ConfigError(
                "max_age_secs must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn dir_cache_time(&self) -> Duration {
        Duration::from_secs(self.dir_cache_time_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            mount_path: default_mount_path(),
            strip_query: false,
            strip_domain: false,
            shard_level: default_shard_level(),
            max_retries: default_max_retries(),
            min_sleep_ms: default_min_sleep_ms(),
            max_sleep_ms: default_max_sleep_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            cache: CacheConfig::default(),
            metrics_endpoint: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - mount_path must start with '/'
    /// - min_sleep_ms must not exceed max_sleep_ms
    /// - the cache section must be valid
    /// - an enabled metrics endpoint needs a socket address
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if !self.mount_path.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "mount_path must start with '/', got '{}'",
                self.mount_path
            )));
        }

        if self.min_sleep_ms > self.max_sleep_ms {
            return Err(ProxyError::ConfigError(format!(
                "min_sleep_ms ({}) must not exceed max_sleep_ms ({})",
                self.min_sleep_ms, self.max_sleep_ms
            )));
        }

        self.cache.validate()?;

        if let Some(endpoint) = &self.metrics_endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    ProxyError::ConfigError(format!(
                        "Invalid metrics endpoint address '{}': {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    /// Mount path without a trailing slash; the root mount is empty
    pub fn normalized_mount_path(&self) -> String {
        self.mount_path.trim_end_matches('/').to_string()
    }

    /// Retry policy for the shared upstream pacer
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_sleep(
            self.max_retries,
            Duration::from_millis(self.min_sleep_ms),
            Duration::from_millis(self.max_sleep_ms),
        )
    }
}
