//! Configuration for the Runlet engine.
//!
//! All knobs load from the environment with sensible defaults, so a bare
//! `runlet serve` works against a local manifest and blob directory.
//! Durations accept humantime strings ("30s", "2m").

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default wall-clock deadline for one invocation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Default deadline for synchronous sub-module loads during bootstrap.
pub const DEFAULT_LOAD_DEADLINE: Duration = Duration::from_secs(5);

/// Default per-guest memory cap in bytes (256 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 256 * 1024 * 1024;

/// Default cache high-water mark in bytes (2 GiB).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default cap on logged request/response bodies in bytes (64 KiB).
pub const DEFAULT_LOG_BODY_CAP: usize = 64 * 1024;

/// Where the blob fetcher finds package archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobSource {
    /// HTTP(S) object store; package paths resolve against this base URL.
    Http {
        /// Base URL, e.g. `https://blobs.internal/packages`
        base_url: String,
        /// Optional bearer token for the object store
        token: Option<String>,
    },
    /// Local directory; package paths resolve inside it. Dev and tests.
    Dir {
        /// Root of the local archive tree
        root: PathBuf,
    },
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP surface binds to
    pub bind_address: SocketAddr,
    /// Root directory for extracted package entries
    pub cache_root: PathBuf,
    /// Cache high-water mark in bytes; eviction starts above this
    pub cache_max_bytes: u64,
    /// Where package archives live
    pub blob_source: BlobSource,
    /// Optional JSON manifest seeding the metadata store (standalone mode)
    pub manifest_path: Option<PathBuf>,
    /// Wall-clock deadline per invocation
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Deadline for synchronous sub-module loads during bootstrap
    #[serde(with = "humantime_serde")]
    pub load_deadline: Duration,
    /// Per-guest memory cap in bytes
    pub memory_limit_bytes: usize,
    /// Maximum concurrently executing guests
    pub max_concurrent: usize,
    /// How often the scheduler sweeps for due functions; None disables it
    #[serde(default, with = "humantime_serde::option")]
    pub scheduler_interval: Option<Duration>,
    /// Byte cap applied to logged request/response bodies
    pub log_body_cap: usize,
    /// Shared bearer token protecting the non-invoke endpoints, if set
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7400".parse().expect("default bind address"),
            cache_root: PathBuf::from("./runlet-cache"),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            blob_source: BlobSource::Dir {
                root: PathBuf::from("./packages"),
            },
            manifest_path: None,
            deadline: DEFAULT_DEADLINE,
            load_deadline: DEFAULT_LOAD_DEADLINE,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
            max_concurrent: 32,
            scheduler_interval: Some(Duration::from_secs(60)),
            log_body_cap: DEFAULT_LOG_BODY_CAP,
            admin_token: None,
        }
    }
}

impl Config {
    /// Load configuration from `RUNLET_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(bind) = std::env::var("RUNLET_BIND") {
            config.bind_address = bind
                .parse()
                .map_err(|e| Error::Config(format!("RUNLET_BIND '{}': {}", bind, e)))?;
        }
        if let Ok(root) = std::env::var("RUNLET_CACHE_ROOT") {
            config.cache_root = PathBuf::from(root);
        }
        if let Ok(max) = std::env::var("RUNLET_CACHE_MAX_BYTES") {
            config.cache_max_bytes = max
                .parse()
                .map_err(|e| Error::Config(format!("RUNLET_CACHE_MAX_BYTES '{}': {}", max, e)))?;
        }
        if let Ok(base) = std::env::var("RUNLET_BLOB_BASE") {
            config.blob_source = if base.starts_with("http://") || base.starts_with("https://") {
                BlobSource::Http {
                    base_url: base,
                    token: std::env::var("RUNLET_BLOB_TOKEN").ok(),
                }
            } else {
                BlobSource::Dir {
                    root: PathBuf::from(base),
                }
            };
        }
        if let Ok(manifest) = std::env::var("RUNLET_MANIFEST") {
            config.manifest_path = Some(PathBuf::from(manifest));
        }
        if let Ok(deadline) = std::env::var("RUNLET_DEADLINE") {
            config.deadline = parse_duration("RUNLET_DEADLINE", &deadline)?;
        }
        if let Ok(load) = std::env::var("RUNLET_LOAD_DEADLINE") {
            config.load_deadline = parse_duration("RUNLET_LOAD_DEADLINE", &load)?;
        }
        if let Ok(mem) = std::env::var("RUNLET_MEMORY_LIMIT_BYTES") {
            config.memory_limit_bytes = mem.parse().map_err(|e| {
                Error::Config(format!("RUNLET_MEMORY_LIMIT_BYTES '{}': {}", mem, e))
            })?;
        }
        if let Ok(max) = std::env::var("RUNLET_MAX_CONCURRENT") {
            config.max_concurrent = max
                .parse()
                .map_err(|e| Error::Config(format!("RUNLET_MAX_CONCURRENT '{}': {}", max, e)))?;
        }
        if let Ok(interval) = std::env::var("RUNLET_SCHEDULER_INTERVAL") {
            config.scheduler_interval = if interval.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_duration("RUNLET_SCHEDULER_INTERVAL", &interval)?)
            };
        }
        if let Ok(cap) = std::env::var("RUNLET_LOG_BODY_CAP") {
            config.log_body_cap = cap
                .parse()
                .map_err(|e| Error::Config(format!("RUNLET_LOG_BODY_CAP '{}': {}", cap, e)))?;
        }
        if let Ok(token) = std::env::var("RUNLET_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the loaded values.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".into()));
        }
        if self.deadline.is_zero() {
            return Err(Error::Config("deadline must be non-zero".into()));
        }
        if self.memory_limit_bytes < 8 * 1024 * 1024 {
            return Err(Error::Config(
                "memory_limit_bytes below 8 MiB cannot boot a guest".into(),
            ));
        }
        Ok(())
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the cache root directory.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Set the blob source.
    pub fn with_blob_source(mut self, source: BlobSource) -> Self {
        self.blob_source = source;
        self
    }

    /// Set the invocation deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the maximum number of concurrent guests.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("{} '{}': {}", key, value, e)))
}
