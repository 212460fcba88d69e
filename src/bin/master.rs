use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use shardmesh::storage::{NodeMeta, SnapshotKv};
use shardmesh::{ClusterConfig, ClusterController, ControllerSettings, NodeRole};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "master")]
#[command(about = "Cluster master: connects the slaves, maps shards and builds the slave mesh")]
struct Cli {
    #[arg(long = "cluster_config")]
    cluster_config: PathBuf,
    /// Overrides the master db root from the config file
    #[arg(long = "db_path_root")]
    db_path_root: Option<String>,
    #[arg(long = "server_port")]
    server_port: Option<u16>,
    #[arg(long = "local_port")]
    local_port: Option<u16>,
    #[arg(long = "seed_host")]
    seed_host: Option<String>,
    #[arg(long = "seed_port")]
    seed_port: Option<u16>,
    #[arg(long = "devp2p_port")]
    devp2p_port: Option<u16>,
    #[arg(long = "devp2p_bootstrap_host")]
    devp2p_bootstrap_host: Option<String>,
    #[arg(long = "devp2p_bootstrap_port")]
    devp2p_bootstrap_port: Option<u16>,
    #[arg(long = "devp2p_min_peers")]
    devp2p_min_peers: Option<u32>,
    #[arg(long = "devp2p_max_peers")]
    devp2p_max_peers: Option<u32>,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    mine: bool,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    devp2p: bool,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    clean: bool,
    /// Seconds between dial attempts to an unreachable slave
    #[arg(long = "retry_delay", default_value_t = 1)]
    retry_delay: u64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardmesh=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Applies command-line overrides to the loaded master section.
fn apply_overrides(config: &mut ClusterConfig, cli: &Cli) {
    let master = &mut config.master;
    if let Some(root) = &cli.db_path_root {
        master.db_path_root = root.clone();
    }
    if let Some(port) = cli.server_port {
        master.server_port = port;
    }
    if let Some(port) = cli.local_port {
        master.json_rpc_port = port;
    }
    if let Some(host) = &cli.seed_host {
        master.seed_host = host.clone();
    }
    if let Some(port) = cli.seed_port {
        master.seed_port = port;
    }
    if let Some(port) = cli.devp2p_port {
        master.devp2p_port = port;
    }
    if let Some(host) = &cli.devp2p_bootstrap_host {
        master.devp2p_bootstrap_host = host.clone();
    }
    if let Some(port) = cli.devp2p_bootstrap_port {
        master.devp2p_bootstrap_port = port;
    }
    if let Some(peers) = cli.devp2p_min_peers {
        master.devp2p_min_peers = peers;
    }
    if let Some(peers) = cli.devp2p_max_peers {
        master.devp2p_max_peers = peers;
    }
    master.devp2p |= cli.devp2p;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClusterConfig::load(&cli.cluster_config)
        .with_context(|| format!("loading cluster config {}", cli.cluster_config.display()))?;
    apply_overrides(&mut config, &cli);

    let mut store = SnapshotKv::open(&config.master.db_path_root, cli.clean)
        .context("opening master store")?;
    let settings = ControllerSettings::new().retry_delay(Duration::from_secs(cli.retry_delay));
    let meta = NodeMeta::record_start(&mut store, NodeRole::Master, &settings.master_id)?;
    store.flush().context("flushing master store")?;
    info!(
        starts = meta.start_count,
        mine = cli.mine,
        devp2p = config.master.devp2p,
        server_port = config.master.server_port,
        json_rpc_port = config.master.json_rpc_port,
        "master starting"
    );

    let mut controller = ClusterController::new(config, settings);
    let outcome = tokio::select! {
        result = controller.run() => Some(result),
        _ = shutdown_signal() => None,
    };
    match outcome {
        Some(result) => result.context("cluster failed")?,
        None => {
            warn!("interrupted, shutting down");
            controller.shutdown("interrupted by operator");
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{:#}", err), "master exiting");
        std::process::exit(1);
    }
}
