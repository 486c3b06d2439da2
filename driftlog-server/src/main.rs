mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use driftlog_core::{LocalSpool, PersisterStatus};
use server::run_server;
use std::collections::BTreeMap;

#[derive(Parser)]
#[command(name = "driftlog")]
#[command(about = "Persists spooled journal fragments into durable blob storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print spooled fragments awaiting persistence, as status JSON
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftlog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Driftlog server with config: {}", config);

            let cfg = load_config(&config);
            tracing::info!(
                "Route: {}, Bind: {}, Registry: {}, Blob store: {}",
                cfg.node.route_key,
                cfg.node.bind_addr,
                cfg.registry.backend.as_str(),
                cfg.blob_store.url
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Status { config } => {
            let cfg = load_config(&config);

            match spool_status(&LocalSpool::new(cfg.spool.root.clone())).await {
                Ok(status) => println!("{}", status),
                Err(e) => {
                    tracing::error!("Failed to scan spool: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

/// Status of the spool as a freshly started persister would report it.
async fn spool_status(spool: &LocalSpool) -> driftlog_core::Result<PersisterStatus> {
    let mut journals: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for fragment in spool.scan().await? {
        journals
            .entry(fragment.journal.clone())
            .or_default()
            .push(fragment.content_name());
    }
    Ok(PersisterStatus(journals))
}
