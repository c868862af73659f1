//! # Runlet - A Function-as-a-Service Execution Engine
//!
//! Runlet accepts HTTP invocations addressed to user-defined functions,
//! materializes each function's active package version in a content-addressed
//! disk cache, runs the function's `index.js` inside a per-invocation QuickJS
//! sandbox wired to a curated Node-compatible standard library, records an
//! execution log, and returns the function's HTTP response. A cron scheduler
//! drives the same execution path for periodic runs.
//!
//! ## Core Concepts
//!
//! - **Function**: user code with an `index.js` entry, addressed by id and versioned
//! - **Package**: the archive holding a version's files, fingerprinted by SHA-256
//! - **Guest**: one isolated QuickJS context running one invocation
//! - **Bridge**: the copy-only boundary guest code calls host operations through
//! - **Populator**: the exclusive worker that turns a cache entry Ready
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         HTTP Surface (axum)                          │
//! │      /invoke  /trigger-scheduled  /cache/*  /metrics  /health        │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Invocation Dispatcher                          │
//! │        resolve → authenticate → ensure → invoke → shape → log        │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │ Metadata Store  │   │   Package Cache     │   │    Sandbox Host     │
//! │ (functions +    │   │ (content-addressed, │   │ (QuickJS guest per  │
//! │  execution log) │   │  LRU, per-key lock) │   │  invocation)        │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                 │                         │
//!                                 ▼                         ▼
//! ┌─────────────────────┐              ┌─────────────────────────────────┐
//! │    Blob Fetcher     │              │     Guest Standard Library      │
//! │ (archives, SHA-256) │              │ (fs, http, timers, ... bridged) │
//! └─────────────────────┘              └─────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use runlet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(MemoryStore::from_manifest(&manifest_path)?);
//!     let cache = PackageCache::new(cache_config, fetcher)?;
//!     let dispatcher = Dispatcher::new(&config, store, cache, Metrics::new());
//!     ApiServer::new(dispatcher, config)
//!         .run_with_shutdown(shutdown_signal())
//!         .await
//! }
//! ```

pub mod api;
pub mod blob;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guest;
pub mod metrics;
pub mod pathsafe;
pub mod sandbox;
pub mod store;

pub use config::{BlobSource, Config};
pub use error::{Error, Result};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::api::ApiServer;
    pub use crate::blob::{BlobFetcher, DirBlobFetcher, HttpBlobFetcher};
    pub use crate::cache::{CacheConfig, PackageCache};
    pub use crate::config::{BlobSource, Config};
    pub use crate::dispatch::{Dispatcher, Scheduler};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::Metrics;
    pub use crate::sandbox::{Sandbox, SandboxConfig};
    pub use crate::store::{MemoryStore, MetadataStore};
}
