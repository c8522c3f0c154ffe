use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use codinit::config::AppConfig;
use codinit::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "codinit")]
#[command(version, about = "CodinIT backend - AI code-generation tasks, sandboxes and telemetry")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        #[arg(short, long, default_value_t = 3000)]
        port: u16,

        /// Path to the SQLite task database
        #[arg(long, default_value = "codinit.db")]
        db_path: PathBuf,

        /// Bind all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "codinit=debug,info"
    } else {
        "codinit=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            let config = ServerConfig {
                port,
                db_path,
                dev_mode: dev,
            };
            server::start_server(config, AppConfig::from_env()).await
        }
    }
}
