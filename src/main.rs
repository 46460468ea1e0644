//! capbroker - connection broker for authenticated capability servers
//!
#![doc = "Main entry point for the capbroker CLI."]

use std::path::Path;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capbroker::broker::Broker;
use capbroker::cli::{Cli, Commands};
use capbroker::status;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse_args();
    let config_path = Path::new(&cli.config);

    match cli.command {
        Commands::Status { detailed } => {
            let broker = Broker::open(config_path).await?;
            let all_ready = status::print_status(&broker.registry, detailed);
            broker.shutdown().await;
            if !all_ready {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Servers => {
            let broker = Broker::open(config_path).await?;
            for name in broker.registry.list_servers() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Groups => {
            let broker = Broker::open(config_path).await?;
            for group in broker.registry.list_groups() {
                let members = broker.registry.get_server_group(&group);
                println!("{group}: {}", members.join(", "));
            }
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capbroker=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
