//! QuorumDB - Replicated SQLite Cluster Node
//!
//! Starts a node that accepts SQL over HTTP and keeps a cluster of
//! embedded databases in lockstep through a majority-committed command
//! log.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorumdb::api;
use quorumdb::command::QueryMachine;
use quorumdb::config::QuorumDbConfig;
use quorumdb::consensus::{ConsensusLog, LogStore, Member, RaftConfig, RaftLog};
use quorumdb::error::Result;
use quorumdb::executor::SqliteExecutor;
use quorumdb::node::Node;

/// QuorumDB - Replicated SQLite Cluster Node
#[derive(Parser)]
#[command(name = "quorumdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "quorumdb.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Address of an existing member to join (overrides the config)
        #[arg(long)]
        join: Option<String>,
    },

    /// Check node status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:4001")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "quorumdb.toml")]
        output: PathBuf,

        /// Data directory (its final component becomes the node name)
        #[arg(long, default_value = "/var/lib/quorumdb/node-1")]
        data_dir: PathBuf,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { join } => run_start(cli.config, cli.log_level, join).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, data_dir } => run_init(output, data_dir),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging from the config, with an optional CLI override
fn init_logging(config: &QuorumDbConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(
    config_path: PathBuf,
    log_level: Option<String>,
    join: Option<String>,
) -> Result<()> {
    let config = match QuorumDbConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    init_logging(&config, log_level.as_deref());

    let name = config.node_name();
    tracing::info!("Starting QuorumDB node {}", name);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    // The database file never survives a restart: its contents are rebuilt
    // from committed log replay.
    let executor = match SqliteExecutor::open(&config.database_path()) {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!("Failed to open database {:?}: {}", config.database_path(), e);
            return Err(e);
        }
    };
    let machine = Arc::new(QueryMachine::new(executor));

    let store = match LogStore::open(&config.log_store_path()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open log store {:?}: {}", config.log_store_path(), e);
            return Err(e);
        }
    };
    let fresh = store.last_index().await? == 0;

    let member = Member {
        name: name.clone(),
        connection_string: config.connection_string(),
    };
    let raft = RaftLog::new(
        member,
        store,
        Arc::clone(&machine) as Arc<dyn quorumdb::consensus::StateMachine>,
        RaftConfig::from(&config.cluster),
    );

    let node = Node::new(
        name,
        config.connection_string(),
        machine,
        Arc::clone(&raft) as Arc<dyn ConsensusLog>,
    );

    let listener = match tokio::net::TcpListener::bind(&config.node.bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.node.bind_address, e);
            return Err(e.into());
        }
    };
    tracing::info!("Listening on {}", config.node.bind_address);

    Arc::clone(&raft).start().await?;

    let join_target = join.or_else(|| config.cluster.join_address.clone());
    match (join_target, fresh) {
        (None, true) => node.bootstrap().await?,
        (None, false) => {
            tracing::info!("Existing log found; membership restored from replay")
        }
        (Some(target), true) => node.join_cluster(&target).await?,
        (Some(_), false) => {
            tracing::info!("Existing log found; already a member, skipping join")
        }
    }

    let app = api::router(Arc::clone(&node), raft);

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("QuorumDB shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| quorumdb::Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(quorumdb::Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, data_dir: PathBuf) -> Result<()> {
    let config_content = format!(
        r#"# QuorumDB Configuration

[node]
# The final path component is the node's name.
data_dir = "{data_dir}"
bind_address = "0.0.0.0:4001"
# advertise_address = "my-public-ip:4001"

[cluster]
# Address of an existing member to join; leave unset to bootstrap a new
# cluster as the sole initial member.
# join_address = "node-1.example.com:4001"
heartbeat_interval_ms = 500
election_timeout_min_ms = 1500
election_timeout_max_ms = 3000

[storage]
database_file = "storage.db"
log_file = "log.db"

[logging]
level = "info"
format = "pretty"
"#,
        data_dir = data_dir.display()
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster settings.");
    println!("Then start with: quorumdb start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match QuorumDbConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node Name:    {}", config.node_name());
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Connection:   {}", config.connection_string());
            println!("  Data Dir:     {}", config.data_dir().display());
            println!(
                "  Join:         {}",
                config.cluster.join_address.as_deref().unwrap_or("(bootstrap)")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
