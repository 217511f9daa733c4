//! VFS cache proxy
//!
//! Exposes arbitrary upstream HTTP URLs as files of a read-only virtual
//! filesystem so they can be streamed through a chunk cache with range
//! support.
//!
//! # Overview
//!
//! A client asks for `<mount>?url=<target>` or `<mount>/<base64(target)>`.
//! The target URL is normalized and digested into a cache key, which becomes
//! the file's name and is registered in the [`UrlRegistry`]. The virtual
//! filesystem ([`UrlFs`]) stats registered files by probing upstream with a
//! one-byte ranged GET, unless the caller supplied the size. The caching
//! layer ([`Vfs`]) reads files in aligned chunks kept in a two-tier cache,
//! and the [`ProxyHandler`] answers with standard range and conditional
//! semantics.
//!
//! # Architecture
//!
//! - [`cache_key`]: URL normalization, MD5 keys, sharded paths and the memoizing [`HashCache`]
//! - [`registry`]: identifier to upstream URL table
//! - [`resolver`] and [`pacer`]: metadata probe with paced, bounded retries
//! - [`remote_fs`]: the [`RemoteFs`] capability trait and the read-only [`UrlFs`]
//! - [`vfs`], [`chunk_calculator`] and [`tiered_cache`]: chunked reads through memory and disk
//! - [`handler`], [`response_builder`] and [`server`]: the HTTP façade
//! - [`config`], [`error`], [`metrics`] and [`metrics_endpoint`]: ambient concerns
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! mount_path: "/stream"
//! strip_query: false
//! strip_domain: false
//! shard_level: 1
//! cache:
//!   cache_mode: full
//!   cache_dir: /var/cache/vfscache-proxy
//!   max_age_secs: 3600
//!   chunk_size: 8388608
//!   chunk_streams: 2
//! metrics_endpoint:
//!   enabled: true
//!   address: "127.0.0.1:9090"
//! ```
//!
//! See [`ProxyConfig`] for every option.
//!
//! # Error Handling
//!
//! ```rust,no_run
//! use vfscache_proxy::{ProxyConfig, ProxyError};
//!
//! # fn main() {
//! match ProxyConfig::from_file("config.yaml") {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(ProxyError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod cache_key;
pub mod chunk_calculator;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod pacer;
pub mod registry;
pub mod remote_fs;
pub mod resolver;
pub mod response_builder;
pub mod server;
pub mod tiered_cache;
pub mod vfs;

// Re-export commonly used types
pub use cache_key::{compute_key, sharded_path, strip_url, HashCache};
pub use chunk_calculator::{ChunkCalculator, ChunkSpec, Chunks};
pub use config::{CacheConfig, CacheMode, ProxyConfig};
pub use error::{ProxyError, Result};
pub use handler::ProxyHandler;
pub use metrics::ProxyMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{ByteRange, FileInfo, FileMetadata, Node};
pub use pacer::{Pacer, RetryPolicy};
pub use registry::{RegistryEntry, UrlRegistry};
pub use remote_fs::{ByteStream, RemoteFs, RemoteObject, UrlFs};
pub use resolver::MetadataResolver;
pub use tiered_cache::{TieredCache, TieredCacheStats};
pub use vfs::Vfs;
