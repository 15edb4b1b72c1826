//! Restart checkpoints and the sink that receives them
//!
//! A checkpoint is emitted after every committed batch. It names the partition
//! in progress and the key tuple of the last committed row; resuming from it
//! skips earlier partitions and continues strictly after that tuple.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::error::{Error, Result};
use crate::pump::TransferCounters;
use crate::types::KeyTuple;

/// Position of the last committed row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Partition in progress
    pub partition: u32,
    /// Key tuple of the last committed row
    pub keys: KeyTuple,
}

impl Checkpoint {
    /// Create a checkpoint
    pub fn new(partition: u32, keys: KeyTuple) -> Self {
        Self { partition, keys }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("failed to serialize checkpoint: {}", e)))
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid checkpoint: {}", e)))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {} after {}", self.partition, self.keys)
    }
}

/// Receives a checkpoint after each committed batch.
///
/// The sink persists checkpoints for operator-driven resume. A failing sink
/// does not undo the batch; the pump logs the error and continues.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Called once per committed batch with cumulative counters
    async fn on_batch_committed(
        &self,
        partition: u32,
        last_key: &KeyTuple,
        counters: &TransferCounters,
    ) -> Result<()>;
}

/// Logs every checkpoint in restart form
#[derive(Debug, Clone, Default)]
pub struct TracingCheckpointSink;

#[async_trait]
impl CheckpointSink for TracingCheckpointSink {
    async fn on_batch_committed(
        &self,
        partition: u32,
        last_key: &KeyTuple,
        counters: &TransferCounters,
    ) -> Result<()> {
        let typed: Vec<String> = last_key
            .values()
            .iter()
            .map(|v| format!("{} {}", v, v.sql_type()))
            .collect();
        info!(
            restart_partition = partition,
            restart_keys = %typed.join(", "),
            rows_fetched = counters.rows_fetched,
            batches = counters.batches_completed,
            "checkpoint"
        );
        Ok(())
    }
}

/// Keeps every checkpoint in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointSink {
    entries: Mutex<Vec<(Checkpoint, TransferCounters)>>,
}

impl MemoryCheckpointSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints received, oldest first
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.entries.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Most recent checkpoint and counters
    pub fn last(&self) -> Option<(Checkpoint, TransferCounters)> {
        self.entries.lock().last().cloned()
    }

    /// Number of checkpoints received
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing was received
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn on_batch_committed(
        &self,
        partition: u32,
        last_key: &KeyTuple,
        counters: &TransferCounters,
    ) -> Result<()> {
        self.entries
            .lock()
            .push((Checkpoint::new(partition, last_key.clone()), *counters));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_checkpoint_json_keeps_types() {
        let cp = Checkpoint::new(
            3,
            KeyTuple::new(vec![Value::Int32(7), Value::String("b".into())]),
        );
        let json = cp.to_json().unwrap();
        let back = Checkpoint::from_json(&json).unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.keys.get(0), Some(&Value::Int32(7)));
    }

    #[test]
    fn test_checkpoint_from_bad_json() {
        let err = Checkpoint::from_json("{\"partition\": 1}").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_memory_sink_records() {
        let sink = MemoryCheckpointSink::new();
        let counters = TransferCounters::default();
        sink.on_batch_committed(1, &KeyTuple::new(vec![Value::Int64(10)]), &counters)
            .await
            .unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.last().unwrap().0.partition, 1);
    }
}
