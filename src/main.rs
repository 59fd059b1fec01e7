use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowhub::config::Config;
use knowhub::{server, worker};

#[derive(Parser)]
#[command(
    name = "knowhub",
    about = "KnowHub — document ingestion and retrieval-augmented generation backend",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP coordinator
    Serve {
        /// Bind address, overriding BIND_ADDR
        #[arg(long)]
        bind: Option<String>,
    },

    /// Start a queue worker
    Worker {
        /// Queues to consume, comma-separated (defaults to all)
        #[arg(long, value_delimiter = ',')]
        queues: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            server::run_server(config).await?;
        }
        Commands::Worker { queues } => {
            worker::run_worker(config, queues).await?;
        }
    }

    Ok(())
}
