use std::time::Duration;

/// Tuning knobs for the cluster controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Node id the master announces in its handshake
    pub master_id: String,

    /// Pause between failed dials to a slave
    pub retry_delay: Duration,

    /// Give up on a slave after this many failed dials; `None` retries forever
    pub max_connect_attempts: Option<u32>,

    /// Deadline for a single RPC; `None` waits until the connection closes
    pub rpc_timeout: Option<Duration>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            master_id: "master".to_string(),
            retry_delay: Duration::from_secs(1),
            max_connect_attempts: None,
            rpc_timeout: None,
        }
    }
}

impl ControllerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master_id(mut self, id: &str) -> Self {
        self.master_id = id.to_string();
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = Some(attempts);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    /// Returns true once `attempts` failed dials exhaust the budget.
    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_connect_attempts
            .is_some_and(|max| attempts >= max)
    }
}
