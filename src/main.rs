//! WolfStore - Tablet Replica Clone Engine
//!
//! Runs a storage node that serves snapshots to other nodes, or clones one
//! tablet replica from a remote node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use wolfstore::clone::{CloneContext, CloneRequest, CloneTaskPool, SourceBackend};
use wolfstore::config::{LoggingConfig, WolfStoreConfig};
use wolfstore::http::FileServer;
use wolfstore::network::{RpcServer, SnapshotClient};
use wolfstore::storage::StorageEngine;

/// WolfStore - Tablet Replica Clone Engine
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides `[logging]`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json); overrides `[logging]`
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve snapshots to cloning nodes
    Serve,

    /// Clone one tablet replica from remote nodes
    Clone(CloneArgs),

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfstore.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "be-1")]
        node_id: String,

        /// Storage root
        #[arg(long, default_value = "/var/lib/wolfstore")]
        data_dir: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Args)]
struct CloneArgs {
    #[arg(long)]
    tablet_id: i64,

    #[arg(long)]
    schema_hash: i32,

    #[arg(long)]
    replica_id: i64,

    /// Visible version the replica must reach
    #[arg(long)]
    version: i64,

    #[arg(long, default_value_t = 0)]
    table_id: i64,

    #[arg(long, default_value_t = 0)]
    partition_id: i64,

    /// Source node as host:be_port:http_port, tried in the given order
    #[arg(long = "source", required = true)]
    sources: Vec<SourceBackend>,

    /// Snapshot timeout on the source in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Data dir to place a new replica on
    #[arg(long)]
    dest_path_hash: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level;
    let log_format = cli.log_format;

    match cli.command {
        Commands::Serve => {
            let config = load_config(&cli.config)?;
            init_logging(&config.logging.clone().with_overrides(log_level, log_format))?;
            run_serve(config).await
        }
        Commands::Clone(args) => {
            let config = load_config(&cli.config)?;
            init_logging(&config.logging.clone().with_overrides(log_level, log_format))?;
            run_clone(config, args).await
        }
        Commands::Init {
            output,
            node_id,
            data_dir,
        } => {
            init_logging(&LoggingConfig::default().with_overrides(log_level, log_format))?;
            run_init(output, node_id, data_dir)
        }
        Commands::Validate => {
            init_logging(&LoggingConfig::default().with_overrides(log_level, log_format))?;
            run_validate(cli.config)
        }
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let writer = Arc::new(file);
            if logging.is_json() {
                tracing_subscriber::fmt::layer().json().with_writer(writer).boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed()
            }
        }
        None if logging.is_json() => tracing_subscriber::fmt::layer().json().boxed(),
        None => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry().with(layer).with(env_filter).init();
    Ok(())
}

fn load_config(config_path: &PathBuf) -> anyhow::Result<WolfStoreConfig> {
    WolfStoreConfig::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))
}

fn open_engine(config: &WolfStoreConfig) -> anyhow::Result<Arc<StorageEngine>> {
    for path in &config.storage.paths {
        std::fs::create_dir_all(&path.path)
            .with_context(|| format!("failed to create storage root {}", path.path.display()))?;
    }
    StorageEngine::open(&config.storage, &config.snapshot).context("failed to open storage engine")
}

/// Serve snapshot RPCs and snapshot files until interrupted
async fn run_serve(config: WolfStoreConfig) -> anyhow::Result<()> {
    tracing::info!("Starting WolfStore node...");

    tracing::info!("Loaded configuration for node: {}", config.node.id);
    let engine = open_engine(&config)?;
    tracing::info!(
        "Storage engine opened with {} data dirs and {} tablets",
        engine.data_dirs().len(),
        engine.tablet_manager().tablet_count()
    );

    let rpc = RpcServer::bind(&config.rpc.bind_address, Arc::clone(&engine))
        .await
        .with_context(|| format!("failed to bind RPC server to {}", config.rpc.bind_address))?;
    let rpc_shutdown = rpc.shutdown_handle();
    let rpc_handle = tokio::spawn(async move {
        if let Err(e) = rpc.serve().await {
            tracing::error!("Snapshot RPC server error: {}", e);
        }
    });

    let mut http_shutdown = None;
    let mut http_handle = None;
    if config.http.enabled {
        let server = FileServer::bind(
            &config.http.bind_address,
            config.node.token.clone(),
            engine.snapshot_roots(),
        )
        .await
        .with_context(|| format!("failed to bind HTTP server to {}", config.http.bind_address))?;
        http_shutdown = Some(server.shutdown_handle());
        http_handle = Some(tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                tracing::error!("Snapshot file server error: {}", e);
            }
        }));
    }

    // Expired snapshots and rowsets dropped by full clones
    let sweep_engine = Arc::clone(&engine);
    let sweep_interval = config.snapshot_sweep_interval();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let engine = Arc::clone(&sweep_engine);
            let swept = tokio::task::spawn_blocking(move || -> wolfstore::Result<(usize, usize)> {
                Ok((
                    engine.sweep_expired_snapshots()?,
                    engine.sweep_unused_rowset_files()?,
                ))
            })
            .await;
            match swept {
                Ok(Ok((snapshots, files))) if snapshots + files > 0 => {
                    tracing::info!(snapshots, files, "swept garbage");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("Sweep failed: {}", e),
                Err(e) => tracing::warn!("Sweep task failed: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    // Cleanup
    sweeper.abort();
    let _ = rpc_shutdown.send(true);
    if let Some(shutdown) = http_shutdown {
        let _ = shutdown.send(true);
    }
    let _ = rpc_handle.await;
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }

    tracing::info!("WolfStore shutdown complete");
    Ok(())
}

/// Clone one replica and print its report
async fn run_clone(config: WolfStoreConfig, args: CloneArgs) -> anyhow::Result<()> {
    let engine = open_engine(&config)?;

    let snapshots = Arc::new(SnapshotClient::new(
        config.clone.rpc_connect_timeout(),
        config.clone.rpc_request_timeout(),
    ));
    let context = Arc::new(CloneContext::new(
        engine,
        snapshots,
        config.clone.clone(),
        config.node.token.clone(),
    ));
    let pool = CloneTaskPool::new(context, config.clone.max_concurrent_clones);

    let mut request = CloneRequest::new(args.tablet_id, args.schema_hash, args.replica_id, args.version);
    request.table_id = args.table_id;
    request.partition_id = args.partition_id;
    request.src_backends = args.sources;
    request.timeout_s = args.timeout;
    request.dest_path_hash = args.dest_path_hash;

    let tablet_infos = pool
        .submit(request)
        .await
        .context("clone task did not complete")?
        .with_context(|| format!("failed to clone tablet {}", args.tablet_id))?;

    println!("{}", serde_json::to_string_pretty(&tablet_infos)?);
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String, data_dir: PathBuf) -> anyhow::Result<()> {
    let config_content = WolfStoreConfig::template(&node_id, &data_dir);

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the cluster token and storage roots.");
    println!("Then start with: wolfstore --config {} serve", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Storage roots: {}", config.storage.paths.len());
            for path in &config.storage.paths {
                println!("    {} ({:?})", path.path.display(), path.medium);
            }
            println!("  RPC Address: {}", config.rpc.bind_address);
            println!("  HTTP Address: {}", config.http.bind_address);
            println!("  Batch download: {}", config.clone.enable_batch_download);
            println!("  Max concurrent clones: {}", config.clone.max_concurrent_clones);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
