use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// MiniSnowflake is a lightweight analytical SQL engine that shards
/// tables over column-oriented files and runs queries map/reduce style
/// over a pool of workers.
#[derive(Parser, Debug)]
#[command(name = "minisnowflake", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "minisnowflake.toml"
    #[arg(short, long, default_value = "minisnowflake.toml")]
    pub config: PathBuf,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the coordinator.
    Coordinator {
        /// Override the configured listen port.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Start a worker.
    Worker {
        /// Unique worker identifier.
        #[arg(long)]
        id: String,

        /// Address to listen on, e.g. "0.0.0.0:8331".
        #[arg(long)]
        listen: String,

        /// Address the coordinator dials for tasks. Default: the listen
        /// address.
        #[arg(long)]
        advertise: Option<String>,

        /// Coordinator host:port to heartbeat.
        #[arg(long)]
        coordinator: String,
    },

    /// Check the configuration file for errors.
    Configcheck,
}

/// Confirm that the configuration file is valid.
#[allow(clippy::print_stdout)]
pub fn config_check(path: &PathBuf) -> Result<(), crate::config::Error> {
    let config = Config::load(path)?;
    config.check()?;
    println!("{}: configuration OK", path.display());

    Ok(())
}
