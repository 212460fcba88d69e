use super::engine::KvStore;
use super::keys::NODE_META;
use crate::core::{NodeRole, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the process owning a store, rewritten on every start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub role: NodeRole,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    /// Number of starts recorded in this store, this one included.
    pub start_count: u64,
}

impl NodeMeta {
    pub fn load<S: KvStore + ?Sized>(store: &S) -> Result<Option<Self>> {
        match store.get(NODE_META)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records a start of `node_id`, bumping the start counter of any
    /// previous record.
    pub fn record_start<S: KvStore + ?Sized>(
        store: &mut S,
        role: NodeRole,
        node_id: &str,
    ) -> Result<Self> {
        let start_count = Self::load(&*store)?.map_or(0, |prev| prev.start_count) + 1;
        let meta = Self {
            role,
            node_id: node_id.to_string(),
            started_at: Utc::now(),
            start_count,
        };
        store.put(NODE_META, &rmp_serde::to_vec_named(&meta)?)?;
        Ok(meta)
    }
}
