//! Tier configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// When a mutation is acknowledged relative to its replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Acknowledge only after the passive has applied the change.
    #[default]
    Sync,
    /// Acknowledge once the change is queued for the passive.
    Async,
}

/// When a mutation is acknowledged relative to client invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Block the mutation until every responder acknowledged (or left).
    #[default]
    Strong,
    /// Fan invalidations out but do not wait for them.
    Eventual,
}

/// Configuration for one tier node.
///
/// Every field has a default, so a JSON file only needs to name the fields
/// it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    /// Identifier used in logs.
    pub node_id: String,
    pub replication_mode: ReplicationMode,
    pub consistency: Consistency,
    /// Chains at or above this many elements are compacted on read and by
    /// the background sweep.
    pub compaction_threshold: usize,
    /// Interval between background compaction sweeps in milliseconds.
    pub compaction_interval_ms: u64,
    /// Number of per-bucket ordering stripes.
    pub ordering_stripes: usize,
    /// Capacity of the active → passive replication queue.
    pub replication_queue_capacity: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            node_id: "tier-0".to_string(),
            replication_mode: ReplicationMode::Sync,
            consistency: Consistency::Strong,
            compaction_threshold: 8,
            compaction_interval_ms: 5_000,
            ordering_stripes: 64,
            replication_queue_capacity: 1024,
        }
    }
}

impl TierConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for
    /// this type, or fails [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading tier config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing tier config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the tier cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.compaction_threshold > 0, "compaction_threshold must be > 0");
        anyhow::ensure!(self.ordering_stripes > 0, "ordering_stripes must be > 0");
        anyhow::ensure!(
            self.replication_queue_capacity > 0,
            "replication_queue_capacity must be > 0"
        );
        anyhow::ensure!(
            self.compaction_interval_ms > 0,
            "compaction_interval_ms must be > 0"
        );
        Ok(())
    }
}
