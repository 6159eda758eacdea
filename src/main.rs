use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sixlease::{Config, Dhcp6Server, Result};

#[derive(Parser)]
#[command(name = "sixlease")]
#[command(author, version, about = "A developer-grade DHCPv6 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCPv6 server with config: {:?}", cli.config);

            let subnets = config.build_subnets()?;
            if subnets.is_empty() {
                warn!("No subnets configured; all clients will be refused");
            }

            let server_id = sixlease::duid::load_or_generate(&config.duid_file).await?;

            let mut server = Dhcp6Server::new(server_id);
            server.set_port(config.port);
            server.cfg_mut().replace_all(subnets);

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
