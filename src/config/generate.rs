use super::{ClusterConfig, DEFAULT_SHARD_SIZE, MasterConfig, SlaveConfig};
use crate::core::{ClusterError, Result, ShardMask};
use std::net::{IpAddr, Ipv4Addr};

/// Inputs for deterministic config generation.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub slave_count: u32,
    pub ip: IpAddr,
    pub p2p_port: u16,
    pub cluster_port_start: u16,
    pub json_rpc_port: u16,
    pub seed_host: String,
    pub seed_port: u16,
    pub db_path_root: String,
    pub shard_size: u32,
    pub devp2p: bool,
    pub devp2p_port: u16,
    pub devp2p_bootstrap_host: String,
    pub devp2p_bootstrap_port: u16,
    pub devp2p_min_peers: u32,
    pub devp2p_max_peers: u32,
}

impl GenerateOptions {
    pub fn new(slave_count: u32) -> Self {
        Self {
            slave_count,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            p2p_port: 38291,
            cluster_port_start: 38000,
            json_rpc_port: 38391,
            seed_host: "127.0.0.1".to_string(),
            seed_port: 38291,
            db_path_root: "./db".to_string(),
            shard_size: DEFAULT_SHARD_SIZE,
            devp2p: false,
            devp2p_port: 29000,
            devp2p_bootstrap_host: "0.0.0.0".to_string(),
            devp2p_bootstrap_port: 29000,
            devp2p_min_peers: 2,
            devp2p_max_peers: 10,
        }
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    pub fn cluster_port_start(mut self, port: u16) -> Self {
        self.cluster_port_start = port;
        self
    }

    pub fn p2p_port(mut self, port: u16) -> Self {
        self.p2p_port = port;
        self
    }

    pub fn json_rpc_port(mut self, port: u16) -> Self {
        self.json_rpc_port = port;
        self
    }

    pub fn seed(mut self, host: &str, port: u16) -> Self {
        self.seed_host = host.to_string();
        self.seed_port = port;
        self
    }

    pub fn db_path_root(mut self, root: &str) -> Self {
        self.db_path_root = root.to_string();
        self
    }

    pub fn shard_size(mut self, shard_size: u32) -> Self {
        self.shard_size = shard_size;
        self
    }
}

impl ClusterConfig {
    /// Builds a config with one slave per contiguous mask: slave `i` of `n`
    /// gets mask `n | i`, so the slaves partition the shard space with no
    /// overlap and no gap.
    pub fn generate(options: &GenerateOptions) -> Result<Self> {
        let count = options.slave_count;
        if count == 0 || !count.is_power_of_two() {
            return Err(ClusterError::Config(format!(
                "slave count must be a power of two, got {}",
                count
            )));
        }
        if count > options.shard_size {
            return Err(ClusterError::Config(format!(
                "{} slaves cannot each own a shard out of {}",
                count, options.shard_size
            )));
        }
        let last_port = u32::from(options.cluster_port_start) + count - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(ClusterError::Config(format!(
                "{} slaves do not fit above port {}",
                count, options.cluster_port_start
            )));
        }

        let root = options.db_path_root.trim_end_matches('/');
        let mut slaves = Vec::with_capacity(count as usize);
        for index in 0..count {
            let id = format!("S{}", index);
            slaves.push(SlaveConfig {
                db_path_root: format!("{}/slave_{}", root, id),
                id,
                ip: options.ip,
                port: options.cluster_port_start + index as u16,
                shard_masks: vec![ShardMask::for_slave(index, count)?],
            });
        }

        let config = Self {
            master: MasterConfig {
                db_path_root: format!("{}/master", root),
                server_port: options.p2p_port,
                json_rpc_port: options.json_rpc_port,
                seed_host: options.seed_host.clone(),
                seed_port: options.seed_port,
                shard_size: options.shard_size,
                devp2p: options.devp2p,
                devp2p_port: options.devp2p_port,
                devp2p_bootstrap_host: options.devp2p_bootstrap_host.clone(),
                devp2p_bootstrap_port: options.devp2p_bootstrap_port,
                devp2p_min_peers: options.devp2p_min_peers,
                devp2p_max_peers: options.devp2p_max_peers,
            },
            slaves,
        };
        config.validate()?;
        Ok(config)
    }
}
