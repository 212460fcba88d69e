//! Runs master and slaves as child processes with all-or-nothing lifetime:
//! the first member to exit brings the whole cluster down.

pub mod process;
pub mod tree;

pub use process::{LaunchOptions, ProcessRecord, ProgramSpec, master_args, slave_args};

use crate::config::ClusterConfig;
use crate::core::{ClusterError, Result};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

pub const SHUTDOWN_BANNER: &str =
    "================================ SHUTTING DOWN CLUSTER ================================";

/// Shared once-only shutdown trigger.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    initiated: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Terminates every descendant of this process. Returns false if a
    /// shutdown was already under way.
    ///
    /// Inside a tokio runtime the process table scan runs on the blocking
    /// pool; callers observe the exits through their child handles.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(%reason, "shutting down cluster");
        println!("{}", SHUTDOWN_BANNER);
        let root = std::process::id();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let signalled = tree::terminate_descendants(root);
                    debug!(signalled, "descendants signalled");
                });
            }
            Err(_) => {
                tree::terminate_descendants(root);
            }
        }
        true
    }
}

/// How one member process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub label: String,
    pub status: String,
    pub success: bool,
    /// True if the process exited before any shutdown was requested.
    pub unprompted: bool,
}

pub struct Supervisor {
    config: ClusterConfig,
    config_path: PathBuf,
    options: LaunchOptions,
    processes: Vec<ProcessRecord>,
    shutdown: ShutdownSignal,
}

impl Supervisor {
    /// `config_path` is handed to the master; it must hold `config`.
    pub fn new(config: ClusterConfig, config_path: PathBuf, options: LaunchOptions) -> Self {
        Self {
            config,
            config_path,
            options,
            processes: Vec::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn processes(&self) -> &[ProcessRecord] {
        &self.processes
    }

    /// Starts the master, then every slave in configuration order.
    pub async fn launch(&mut self) -> Result<()> {
        let args = master_args(&self.config_path, &self.config.master, &self.options);
        let master = ProcessRecord::spawn(self.options.master_label(), &self.options.master, &args);
        self.track(master)?;

        let slaves: Vec<(String, Vec<String>)> = self
            .config
            .slaves
            .iter()
            .map(|slave| {
                (
                    self.options.slave_label(&slave.id),
                    slave_args(slave, self.options.clean),
                )
            })
            .collect();
        for (label, args) in slaves {
            let record = ProcessRecord::spawn(label.clone(), &self.options.slave, &args);
            if let Err(err) = &record {
                error!(label = %label, error = %err, "failed to start slave");
            }
            self.track(record)?;
        }
        info!(processes = self.processes.len(), "cluster launched");
        Ok(())
    }

    fn track(&mut self, record: Result<ProcessRecord>) -> Result<()> {
        match record {
            Ok(record) => {
                self.processes.push(record);
                Ok(())
            }
            Err(err) => {
                self.shutdown.trigger("launch failed");
                Err(err)
            }
        }
    }

    /// Waits for every process. The first one to exit on its own triggers a
    /// shutdown of the rest.
    pub async fn supervise_all(&mut self) -> Vec<ExitReport> {
        let shutdown = &self.shutdown;
        let waits = self.processes.iter_mut().map(|record| async move {
            let status = record.child.wait().await;
            let unprompted = !shutdown.is_initiated();
            let (status, success) = match status {
                Ok(status) => (status.to_string(), status.success()),
                Err(err) => (format!("wait failed: {}", err), false),
            };
            if unprompted {
                println!("{} is dead. Shutting down the cluster...", record.label);
                warn!(label = %record.label, %status, "cluster member exited");
                shutdown.trigger(&format!("{} exited", record.label));
            }
            ExitReport {
                label: record.label.clone(),
                status,
                success,
                unprompted,
            }
        });
        join_all(waits).await
    }

    /// Stops every member. Only the first call has an effect.
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger("shutdown requested")
    }

    /// Launches the cluster and waits for all members, routing Ctrl-C to
    /// `shutdown`. Fails with `ProcessExit` naming the first member that
    /// exited on its own.
    pub async fn run(&mut self) -> Result<()> {
        self.launch().await?;

        let signal = self.shutdown.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.trigger("interrupted");
            }
        });

        let reports = self.supervise_all().await;
        interrupt.abort();

        match reports.into_iter().find(|report| report.unprompted) {
            Some(report) => Err(ClusterError::ProcessExit {
                label: report.label,
                status: report.status,
            }),
            None => Ok(()),
        }
    }
}
