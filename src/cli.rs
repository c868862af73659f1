//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Runlet: a function-as-a-service execution engine.
#[derive(Debug, Parser)]
#[command(name = "runlet", version, about)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine: HTTP surface plus the cron scheduler
    Serve(ServeArgs),
    /// Check a function manifest without starting the engine
    ValidateManifest(ValidateManifestArgs),
    /// Print the next fire times of a cron expression
    NextRun(NextRunArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Bind address, e.g. 0.0.0.0:7400
    #[arg(long, env = "RUNLET_BIND")]
    pub bind: Option<std::net::SocketAddr>,

    /// Package cache root directory
    #[arg(long, env = "RUNLET_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// Blob source: a base URL or a local directory
    #[arg(long, env = "RUNLET_BLOB_BASE")]
    pub blob_base: Option<String>,

    /// JSON manifest seeding the metadata store
    #[arg(long, env = "RUNLET_MANIFEST")]
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ValidateManifestArgs {
    /// Path to the manifest file
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct NextRunArgs {
    /// Five-field cron expression
    pub expression: String,

    /// How many upcoming fire times to print
    #[arg(long, default_value_t = 5)]
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from(["runlet", "-vv", "serve", "--bind", "127.0.0.1:9000"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind.unwrap().port(), 9000);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_next_run() {
        let cli = Cli::try_parse_from(["runlet", "next-run", "*/5 * * * *", "--count", "3"]).unwrap();
        match cli.command {
            Commands::NextRun(args) => {
                assert_eq!(args.expression, "*/5 * * * *");
                assert_eq!(args.count, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
