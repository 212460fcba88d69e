//! Spawning cluster member processes and relaying their output.

use crate::config::{MasterConfig, SlaveConfig};
use crate::core::{ClusterError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Program to run for a cluster member, plus arguments placed before the
/// generated flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ProgramSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// Executable named `name` next to the running binary, falling back to
    /// `name` on `PATH`.
    pub fn sibling(name: &str) -> Self {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .filter(|path| path.exists());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(name)))
    }
}

/// Everything the supervisor needs beyond the cluster config.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Prefix for every relayed output line
    pub cluster_id: String,
    pub mine: bool,
    pub clean: bool,
    pub master: ProgramSpec,
    pub slave: ProgramSpec,
}

impl LaunchOptions {
    pub fn new(master: ProgramSpec, slave: ProgramSpec) -> Self {
        Self {
            cluster_id: String::new(),
            mine: false,
            clean: false,
            master,
            slave,
        }
    }

    pub fn cluster_id(mut self, id: &str) -> Self {
        self.cluster_id = id.to_string();
        self
    }

    pub fn mine(mut self, mine: bool) -> Self {
        self.mine = mine;
        self
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn master_label(&self) -> String {
        format!("{}MASTER", self.cluster_id)
    }

    pub fn slave_label(&self, slave_id: &str) -> String {
        format!("{}SLAVE_{}", self.cluster_id, slave_id)
    }
}

/// Flags for the master binary.
pub fn master_args(config_path: &Path, master: &MasterConfig, options: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        format!("--cluster_config={}", config_path.display()),
        format!("--db_path_root={}", master.db_path_root),
        format!("--server_port={}", master.server_port),
        format!("--local_port={}", master.json_rpc_port),
        format!("--seed_host={}", master.seed_host),
        format!("--seed_port={}", master.seed_port),
        format!("--devp2p_port={}", master.devp2p_port),
        format!("--devp2p_bootstrap_host={}", master.devp2p_bootstrap_host),
        format!("--devp2p_bootstrap_port={}", master.devp2p_bootstrap_port),
        format!("--devp2p_min_peers={}", master.devp2p_min_peers),
        format!("--devp2p_max_peers={}", master.devp2p_max_peers),
    ];
    if options.mine {
        args.push("--mine=true".to_string());
    }
    if master.devp2p {
        args.push("--devp2p=true".to_string());
    }
    if options.clean {
        args.push("--clean=true".to_string());
    }
    args
}

/// Flags for the slave binary; one `--shard_mask` per mask.
pub fn slave_args(slave: &SlaveConfig, clean: bool) -> Vec<String> {
    let mut args = vec![format!("--node_port={}", slave.port)];
    args.extend(
        slave
            .shard_masks
            .iter()
            .map(|mask| format!("--shard_mask={}", mask.value())),
    );
    args.push(format!("--node_id={}", slave.id));
    args.push(format!("--db_path_root={}", slave.db_path_root));
    args.push(format!("--node_ip={}", slave.ip));
    if clean {
        args.push("--clean=true".to_string());
    }
    args
}

pub fn prefix_line(label: &str, line: &str) -> String {
    format!("{}: {}", label, line.trim_end())
}

/// Prints every line of `stream` prefixed with `label` until EOF.
pub async fn relay_output<R>(label: String, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => println!("{}", prefix_line(&label, &line)),
            Ok(None) => break,
            Err(err) => {
                debug!(label = %label, error = %err, "output relay stopped");
                break;
            }
        }
    }
}

/// A running cluster member.
#[derive(Debug)]
pub struct ProcessRecord {
    pub label: String,
    pub pid: u32,
    pub child: Child,
}

impl ProcessRecord {
    /// Starts `spec` with `args`, relaying stdout and stderr under `label`.
    pub fn spawn(label: String, spec: &ProgramSpec, args: &[String]) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            ClusterError::Io(format!(
                "failed to start {} ({}): {}",
                label,
                spec.program.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ClusterError::ProcessExit {
                label: label.clone(),
                status: "exited before it could be tracked".to_string(),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(label.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(label.clone(), stderr));
        }

        info!(label = %label, pid, program = %spec.program.display(), "process started");
        Ok(Self { label, pid, child })
    }
}
