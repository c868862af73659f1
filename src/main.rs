//! Runlet - a function-as-a-service execution engine.
//!
//! This is the main entry point for the Runlet binary.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runlet::blob::{BlobFetcher, DirBlobFetcher, HttpBlobConfig, HttpBlobFetcher};
use runlet::cache::{CacheConfig, PackageCache};
use runlet::cli::{Cli, Commands, NextRunArgs, ServeArgs, ValidateManifestArgs};
use runlet::config::{BlobSource, Config};
use runlet::dispatch::schedule::CronSchedule;
use runlet::dispatch::{Dispatcher, Scheduler};
use runlet::metrics::Metrics;
use runlet::store::{MemoryStore, MetadataStore};

use runlet::api::ApiServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::ValidateManifest(args) => validate_manifest(args),
        Commands::NextRun(args) => next_run(args),
    }
}

/// Initialize logging based on verbosity level.
fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "runlet=info,warn",
        1 => "runlet=debug,info",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbosity >= 2))
        .with(env_filter)
        .init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(cache_root) = args.cache_root {
        config.cache_root = cache_root;
    }
    if let Some(blob_base) = args.blob_base {
        config.blob_source = if blob_base.starts_with("http://") || blob_base.starts_with("https://")
        {
            BlobSource::Http {
                base_url: blob_base,
                token: std::env::var("RUNLET_BLOB_TOKEN").ok(),
            }
        } else {
            BlobSource::Dir {
                root: blob_base.into(),
            }
        };
    }
    if let Some(manifest) = args.manifest {
        config.manifest_path = Some(manifest);
    }
    config.validate()?;

    let store: Arc<dyn MetadataStore> = match &config.manifest_path {
        Some(path) => Arc::new(MemoryStore::from_manifest(path)?),
        None => {
            tracing::warn!("no manifest configured; starting with an empty function store");
            Arc::new(MemoryStore::new())
        }
    };

    let cache_config = CacheConfig {
        root: config.cache_root.clone(),
        max_bytes: config.cache_max_bytes,
    };
    let spool = config.cache_root.join(".spool");
    let fetcher: Arc<dyn BlobFetcher> = match &config.blob_source {
        BlobSource::Http { base_url, token } => {
            let mut blob_config = HttpBlobConfig::new(base_url.clone(), spool);
            if let Some(token) = token {
                blob_config = blob_config.with_token(token.clone());
            }
            Arc::new(HttpBlobFetcher::new(blob_config)?)
        }
        BlobSource::Dir { root } => Arc::new(DirBlobFetcher::new(root.clone(), spool)),
    };
    let cache = PackageCache::new(cache_config, fetcher)?;

    let dispatcher = Dispatcher::new(&config, store, cache, Metrics::new());

    if let Some(interval) = config.scheduler_interval {
        let scheduler = Scheduler::new(dispatcher.clone(), interval);
        tokio::spawn(scheduler.run(shutdown_signal()));
    }

    ApiServer::new(dispatcher, config)
        .run_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn validate_manifest(args: ValidateManifestArgs) -> Result<()> {
    let store = MemoryStore::from_manifest(&args.path)?;
    println!(
        "{}: {} function(s) loaded",
        args.path.display(),
        store.len()
    );
    Ok(())
}

fn next_run(args: NextRunArgs) -> Result<()> {
    let schedule = CronSchedule::parse(&args.expression)?;
    let mut cursor = chrono::Utc::now();
    for _ in 0..args.count {
        match schedule.next_after(cursor) {
            Some(at) => {
                println!("{}", at.to_rfc3339());
                cursor = at;
            }
            None => {
                println!("(no further fire times)");
                break;
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
