use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use shardmesh::config::DEFAULT_SHARD_SIZE;
use shardmesh::{ClusterConfig, GenerateOptions, LaunchOptions, ProgramSpec, Supervisor};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "cluster")]
#[command(about = "Launches a master and its slaves and keeps them alive together")]
struct Cli {
    /// Config file used when --num_slaves is zero or negative
    #[arg(long = "cluster_config", default_value = "cluster_config.json")]
    cluster_config: PathBuf,
    /// Number of slaves to generate a config for; must be a power of two
    #[arg(long = "num_slaves", default_value_t = 4, allow_hyphen_values = true)]
    num_slaves: i64,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    mine: bool,
    #[arg(long = "ip", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    ip: IpAddr,
    #[arg(long = "port_start", default_value_t = 38000)]
    port_start: u16,
    #[arg(long = "db_path_root", default_value = "./db")]
    db_path_root: String,
    #[arg(long = "p2p_port", default_value_t = 38291)]
    p2p_port: u16,
    #[arg(long = "json_rpc_port", default_value_t = 38391)]
    json_rpc_port: u16,
    #[arg(long = "seed_host", default_value = "127.0.0.1")]
    seed_host: String,
    #[arg(long = "seed_port", default_value_t = 38291)]
    seed_port: u16,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    clean: bool,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    devp2p: bool,
    #[arg(long = "devp2p_port", default_value_t = 29000)]
    devp2p_port: u16,
    #[arg(long = "devp2p_bootstrap_host", default_value = "0.0.0.0")]
    devp2p_bootstrap_host: String,
    #[arg(long = "devp2p_bootstrap_port", default_value_t = 29000)]
    devp2p_bootstrap_port: u16,
    #[arg(long = "devp2p_min_peers", default_value_t = 2)]
    devp2p_min_peers: u32,
    #[arg(long = "devp2p_max_peers", default_value_t = 10)]
    devp2p_max_peers: u32,
    /// Prefix for every relayed output line
    #[arg(long = "cluster_id", default_value = "")]
    cluster_id: String,
    /// Master executable; defaults to `master` next to this binary
    #[arg(long = "master_bin")]
    master_bin: Option<PathBuf>,
    /// Slave executable; defaults to `slave` next to this binary
    #[arg(long = "slave_bin")]
    slave_bin: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardmesh=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn generate_options(cli: &Cli, slave_count: u32) -> GenerateOptions {
    let mut options = GenerateOptions::new(slave_count)
        .ip(cli.ip)
        .cluster_port_start(cli.port_start)
        .p2p_port(cli.p2p_port)
        .json_rpc_port(cli.json_rpc_port)
        .seed(&cli.seed_host, cli.seed_port)
        .db_path_root(&cli.db_path_root)
        .shard_size(slave_count.max(DEFAULT_SHARD_SIZE));
    options.devp2p = cli.devp2p;
    options.devp2p_port = cli.devp2p_port;
    options.devp2p_bootstrap_host = cli.devp2p_bootstrap_host.clone();
    options.devp2p_bootstrap_port = cli.devp2p_bootstrap_port;
    options.devp2p_min_peers = cli.devp2p_min_peers;
    options.devp2p_max_peers = cli.devp2p_max_peers;
    options
}

/// Generates a config for `--num_slaves` or loads `--cluster_config`, and
/// returns it with the path the master should read.
fn resolve_config(cli: &Cli) -> Result<(ClusterConfig, PathBuf)> {
    if cli.num_slaves <= 0 {
        let config = ClusterConfig::load(&cli.cluster_config)
            .with_context(|| format!("loading {}", cli.cluster_config.display()))?;
        return Ok((config, cli.cluster_config.clone()));
    }
    let count = u32::try_from(cli.num_slaves).context("--num_slaves is too large")?;
    let config = ClusterConfig::generate(&generate_options(cli, count))?;
    let path = config.write_temp().context("writing generated config")?;
    info!(path = %path.display(), slaves = count, "generated cluster config");
    Ok((config, path))
}

async fn run(cli: Cli) -> Result<()> {
    let (config, config_path) = resolve_config(&cli)?;

    let master = cli
        .master_bin
        .clone()
        .map(ProgramSpec::new)
        .unwrap_or_else(|| ProgramSpec::sibling("master"));
    let slave = cli
        .slave_bin
        .clone()
        .map(ProgramSpec::new)
        .unwrap_or_else(|| ProgramSpec::sibling("slave"));
    let options = LaunchOptions::new(master, slave)
        .cluster_id(&cli.cluster_id)
        .mine(cli.mine)
        .clean(cli.clean);

    let mut supervisor = Supervisor::new(config, config_path, options);
    supervisor.run().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{:#}", err), "cluster exiting");
        std::process::exit(1);
    }
}
