//! Master-side bring-up and supervision of the slave pool.
//!
//! Bring-up runs through `ConnectingSlaves -> MappingShards ->
//! ConnectingMesh -> Ready`. Any error moves the controller to `Failed`,
//! closes every slave connection and runs the shutdown hook. After `Ready`
//! the controller only waits for a slave connection to drop, which is
//! handled the same way.

use super::assignment::ShardAssignmentTable;
use super::settings::ControllerSettings;
use super::slave::SlaveHandle;
use crate::config::ClusterConfig;
use crate::core::{ClusterError, Result, SlaveInfo};
use futures::StreamExt;
use futures::future::try_join_all;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, error, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    ConnectingSlaves,
    MappingShards,
    ConnectingMesh,
    Ready,
    Failed,
}

/// Invoked once when the controller fails, before `run` returns.
pub type ShutdownHook = Arc<dyn Fn(&ClusterError) + Send + Sync>;

#[derive(Debug)]
struct SlaveClosed {
    slave_id: String,
    reason: String,
}

/// Reports the closure of `handle`'s connection on `closed_tx`.
fn watch_closure(closed_tx: &mpsc::UnboundedSender<SlaveClosed>, handle: &Arc<SlaveHandle>) {
    let conn = handle.connection().clone();
    let slave_id = handle.id().to_string();
    let closed_tx = closed_tx.clone();
    tokio::spawn(async move {
        let reason = conn.closed().await;
        let _ = closed_tx.send(SlaveClosed { slave_id, reason });
    });
}

pub struct ClusterController {
    config: ClusterConfig,
    settings: ControllerSettings,
    state: watch::Sender<ControllerState>,
    slaves: Vec<Arc<SlaveHandle>>,
    assignment: Option<ShardAssignmentTable>,
    failure: Option<ClusterError>,
    shutdown_hook: Option<ShutdownHook>,
    closed_tx: mpsc::UnboundedSender<SlaveClosed>,
    closed_rx: mpsc::UnboundedReceiver<SlaveClosed>,
}

impl ClusterController {
    pub fn new(config: ClusterConfig, settings: ControllerSettings) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            config,
            settings,
            state,
            slaves: Vec::new(),
            assignment: None,
            failure: None,
            shutdown_hook: None,
            closed_tx,
            closed_rx,
        }
    }

    pub fn with_shutdown_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClusterError) + Send + Sync + 'static,
    {
        self.shutdown_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Verified slaves in configuration order.
    pub fn slaves(&self) -> &[Arc<SlaveHandle>] {
        &self.slaves
    }

    pub fn slave(&self, id: &str) -> Option<&Arc<SlaveHandle>> {
        self.slaves.iter().find(|slave| slave.id() == id)
    }

    /// Available once shard mapping has run.
    pub fn assignment(&self) -> Option<&ShardAssignmentTable> {
        self.assignment.as_ref()
    }

    /// The error that moved the controller to `Failed`.
    pub fn failure(&self) -> Option<&ClusterError> {
        self.failure.as_ref()
    }

    fn set_state(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        info!(from = ?previous, to = ?next, "controller state changed");
    }

    // ========================================================================
    // Bring-up
    // ========================================================================

    /// Connects, verifies and interconnects every configured slave.
    pub async fn bring_up(&mut self) -> Result<()> {
        if self.state() != ControllerState::Idle {
            return Err(ClusterError::Config(format!(
                "bring-up cannot start from state {:?}",
                self.state()
            )));
        }

        let span = info_span!("bring_up", slaves = self.config.slaves.len());
        let outcome = self.bring_up_phases().instrument(span).await;
        match outcome {
            Ok(()) => {
                self.set_state(ControllerState::Ready);
                info!("cluster is ready");
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn bring_up_phases(&mut self) -> Result<()> {
        self.set_state(ControllerState::ConnectingSlaves);
        self.connect_slaves().await?;

        self.set_state(ControllerState::MappingShards);
        self.map_shards()?;

        self.set_state(ControllerState::ConnectingMesh);
        self.connect_mesh().await
    }

    async fn connect_and_verify(
        index: usize,
        info: SlaveInfo,
        settings: &ControllerSettings,
    ) -> Result<(usize, Arc<SlaveHandle>)> {
        let handle = SlaveHandle::connect(info, settings).await?;
        if let Err(err) = handle.verify().await {
            error!(slave = %handle.id(), error = %err, "slave verification failed");
            handle.close(&err.to_string());
            return Err(err);
        }
        Ok((index, handle))
    }

    /// Connects and verifies all slaves concurrently. A verified slave is
    /// watched from that moment on, so losing it while others are still
    /// being dialed fails bring-up too.
    async fn connect_slaves(&mut self) -> Result<()> {
        let mut pending: FuturesUnordered<_> = self
            .config
            .slave_infos()
            .into_iter()
            .enumerate()
            .map(|(index, info)| Self::connect_and_verify(index, info, &self.settings))
            .collect();

        let closed_tx = self.closed_tx.clone();
        let mut verified = Vec::with_capacity(pending.len());
        let outcome = loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(Ok((index, handle))) => {
                        watch_closure(&closed_tx, &handle);
                        verified.push((index, handle));
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
                Some(event) = self.closed_rx.recv() => {
                    error!(slave = %event.slave_id, reason = %event.reason, "slave lost during bring-up");
                    break Err(ClusterError::ConnectionClosed(format!(
                        "slave '{}' disconnected: {}",
                        event.slave_id, event.reason
                    )));
                }
            }
        };
        drop(pending);

        if let Err(err) = outcome {
            for (_, handle) in &verified {
                handle.close(&format!("bring-up aborted: {}", err));
            }
            return Err(err);
        }

        verified.sort_by_key(|(index, _)| *index);
        self.slaves
            .extend(verified.into_iter().map(|(_, handle)| handle));
        Ok(())
    }

    fn map_shards(&mut self) -> Result<()> {
        let mut table = ShardAssignmentTable::new(self.config.shard_size())?;
        for slave in &self.slaves {
            table.register(slave.id(), slave.shard_masks());
        }
        for line in table.summary() {
            info!("{}", line);
        }
        let complete = table.ensure_complete();
        self.assignment = Some(table);
        if let Err(err) = &complete {
            error!(error = %err, "shard coverage check failed");
        }
        complete
    }

    async fn connect_mesh(&self) -> Result<()> {
        let infos: Vec<SlaveInfo> = self.slaves.iter().map(|s| s.info().clone()).collect();
        let requests = self.slaves.iter().map(|slave| {
            let targets: Vec<SlaveInfo> = infos
                .iter()
                .filter(|info| info.id != slave.id())
                .cloned()
                .collect();
            async move {
                slave.connect_to_slaves(targets).await.inspect_err(|err| {
                    error!(slave = %slave.id(), error = %err, "mesh setup failed");
                })
            }
        });
        try_join_all(requests).await?;
        info!(slaves = self.slaves.len(), "slave mesh established");
        Ok(())
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Runs bring-up, then waits until any slave connection closes. Always
    /// ends in `Failed` and returns the error that caused it.
    pub async fn run(&mut self) -> Result<()> {
        self.bring_up().await?;

        let Some(event) = self.closed_rx.recv().await else {
            return Ok(());
        };
        let err = ClusterError::ConnectionClosed(format!(
            "slave '{}' disconnected: {}",
            event.slave_id, event.reason
        ));
        error!(slave = %event.slave_id, reason = %event.reason, "lost slave connection");
        self.fail(&err);
        Err(err)
    }

    /// Stops the cluster. Only the first call has an effect.
    pub fn shutdown(&mut self, reason: &str) {
        self.fail(&ClusterError::ConnectionClosed(reason.to_string()));
    }

    fn fail(&mut self, err: &ClusterError) {
        if self.state() == ControllerState::Failed {
            return;
        }
        error!(error = %err, "cluster controller failed, shutting down");
        self.failure = Some(err.clone());
        self.set_state(ControllerState::Failed);

        let reason = format!("cluster shutting down: {}", err);
        for slave in &self.slaves {
            slave.close(&reason);
        }
        if let Some(hook) = &self.shutdown_hook {
            hook(err);
        }
    }
}
