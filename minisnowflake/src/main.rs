use clap::Parser;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use minisnowflake::cli::{self, Cli, Commands};
use minisnowflake::config::Config;
use minisnowflake::worker::WorkerOptions;
use minisnowflake::{frontend, worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Configcheck = cli.command {
        cli::config_check(&cli.config)?;
        return Ok(());
    }

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        info!(
            "no configuration file at \"{}\", using defaults",
            cli.config.display()
        );
        Config::default()
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        });
    }

    match cli.command {
        Commands::Coordinator { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            frontend::launch(config, shutdown).await?;
        }

        Commands::Worker {
            id,
            listen,
            advertise,
            coordinator,
        } => {
            let options = WorkerOptions {
                worker_id: id,
                advertise: advertise.unwrap_or_else(|| listen.clone()),
                listen,
                coordinator,
            };
            worker::launch(config, options, shutdown).await?;
        }

        Commands::Configcheck => unreachable!("handled above"),
    }

    Ok(())
}
