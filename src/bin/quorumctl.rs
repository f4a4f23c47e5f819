//! QuorumCtl - Command line client for QuorumDB nodes
//!
//! Usage:
//!   quorumctl query "CREATE TABLE t (id INTEGER)"  - Run SQL on the cluster
//!   quorumctl status                               - Show node status

use clap::{Parser, Subcommand};

/// QuorumDB cluster client
#[derive(Parser)]
#[command(name = "quorumctl")]
#[command(about = "Query and monitor QuorumDB clusters", long_about = None)]
struct Cli {
    /// Node address to connect to
    #[arg(short, long, default_value = "localhost:4001")]
    address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute SQL against the cluster (any node accepts writes)
    Query {
        /// Raw SQL text, sent exactly as given
        sql: String,
    },
    /// Show status of a node
    Status,
}

#[tokio::main]
async fn main() -> quorumdb::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Query { sql } => run_query(&cli.address, sql).await,
        Commands::Status => run_status(&cli.address).await,
    }
}

async fn run_query(address: &str, sql: String) -> quorumdb::Result<()> {
    let url = format!("http://{}/sql", address);

    let response = reqwest::Client::new()
        .post(&url)
        .body(sql)
        .send()
        .await
        .map_err(|e| quorumdb::Error::Network(format!("unable to reach {}: {}", address, e)))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| quorumdb::Error::Network(e.to_string()))?;

    if status.is_success() {
        print!("{}", body);
        Ok(())
    } else {
        eprintln!("{}: {}", status, body);
        Err(quorumdb::Error::Network(format!(
            "query failed with status {}",
            status
        )))
    }
}

async fn run_status(address: &str) -> quorumdb::Result<()> {
    let url = format!("http://{}/status", address);

    let status: serde_json::Value = reqwest::get(&url)
        .await
        .map_err(|e| quorumdb::Error::Network(format!("unable to reach {}: {}", address, e)))?
        .json()
        .await
        .map_err(|e| quorumdb::Error::Network(e.to_string()))?;

    println!("{}", serde_json::to_string_pretty(&status).unwrap());
    Ok(())
}
