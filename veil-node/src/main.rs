use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use veil_node::config::NodeConfig;
use veil_node::http::HttpServer;
use veil_node::node::SearchNode;

#[derive(Parser)]
#[command(name = "veil-node", about = "Encrypted similarity search node")]
struct Cli {
    #[command(flatten)]
    config: NodeConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP JSON API
    Serve,
    /// Create key material (keeps existing keys unless --force)
    Keygen {
        /// Start a new key epoch; ciphertexts of the old one become unusable
        #[arg(long)]
        force: bool,
    },
    /// Compile (or load) the circuit for the configured shape
    Compile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => serve(cli.config).await,
        Command::Keygen { force } => {
            let node = SearchNode::start(cli.config).await?;
            let result = node.call(move |s| s.generate_keys(force)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            node.shutdown().await
        }
        Command::Compile => {
            let node = SearchNode::start(cli.config).await?;
            let circuit = node.service().engine().prepare()?.circuit;
            println!(
                "{}: {} (digest {})",
                circuit.shape,
                node.startup(),
                hex::encode(&circuit.digest[..8])
            );
            node.shutdown().await
        }
    }
}

async fn serve(config: NodeConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr.to_string();
    let node = Arc::new(SearchNode::start(config).await?);
    let server = Arc::new(HttpServer::bind(&addr)?);
    info!("listening on {}", addr);

    let accept = {
        let (server, node) = (server.clone(), node.clone());
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || server.serve(node, runtime))
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    server.unblock();
    let _ = accept.join();
    node.shutdown().await
}
