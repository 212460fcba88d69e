use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use shardmesh::storage::{NodeMeta, SnapshotKv};
use shardmesh::{NodeRole, ShardMask, SlaveInfo, SlaveServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "slave")]
#[command(about = "Cluster slave: serves a set of shards for the master")]
struct Cli {
    #[arg(long = "node_port")]
    node_port: u16,
    /// Shard mask served by this slave; repeat for several masks
    #[arg(long = "shard_mask", action = ArgAction::Append, required = true)]
    shard_mask: Vec<u32>,
    #[arg(long = "node_id")]
    node_id: String,
    #[arg(long = "db_path_root")]
    db_path_root: String,
    #[arg(long = "node_ip", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    node_ip: IpAddr,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    clean: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardmesh=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let shard_masks = cli
        .shard_mask
        .iter()
        .map(|mask| ShardMask::new(*mask))
        .collect::<shardmesh::Result<Vec<_>>>()
        .context("invalid --shard_mask")?;

    let mut store = SnapshotKv::open(&cli.db_path_root, cli.clean).context("opening slave store")?;
    let meta = NodeMeta::record_start(&mut store, NodeRole::Slave, &cli.node_id)?;
    store.flush().context("flushing slave store")?;

    let addr = SocketAddr::new(cli.node_ip, cli.node_port);
    let identity = SlaveInfo::new(cli.node_id.clone(), addr, shard_masks);
    info!(
        slave = %identity.id,
        %addr,
        masks = ?identity.shard_masks,
        starts = meta.start_count,
        "slave starting"
    );

    let server = SlaveServer::bind(identity, addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let handle = server.handle()?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            handle.shutdown();
        }
    });
    server.run().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{:#}", err), "slave exiting");
        std::process::exit(1);
    }
}
