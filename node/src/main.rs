//! utxodex Node Binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use utxodex_core::IndexerConfig;
use utxodex_node::NodeBuilder;

#[derive(Parser)]
#[command(name = "utxodex-node")]
#[command(about = "utxodex - reorg-safe UTXO indexer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexer
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API listen address
        #[arg(long)]
        api_addr: Option<String>,

        /// Full node RPC URL
        #[arg(long)]
        rpc_url: Option<String>,
    },

    /// Print the default configuration
    Config,
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data_dir,
            api_addr,
            rpc_url,
        } => {
            let config = match config {
                Some(path) => IndexerConfig::from_json_file(&path)?,
                None => IndexerConfig::default(),
            };
            init_logging(&config.log_level);

            let mut builder = NodeBuilder::new().config(config);
            if let Some(dir) = data_dir {
                builder = builder.data_dir(dir);
            }
            if let Some(addr) = api_addr {
                builder = builder.api_addr(&addr);
            }
            if let Some(url) = rpc_url {
                builder = builder.rpc_url(&url);
            }

            let node = builder.build()?;
            info!("Data directory: {}", node.runtime().config().data_dir.display());

            node.start().await?;
        }

        Commands::Config => {
            println!("{}", IndexerConfig::default().to_json()?);
        }
    }

    Ok(())
}
