//! Restart file written after every committed batch

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyfill::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Contents of a restart file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Source table of the transfer that wrote the file
    pub source_table: String,
    /// Destination table of the transfer that wrote the file
    pub destination_table: String,
    /// Last committed position
    pub checkpoint: Checkpoint,
    /// Counters of the run that wrote the file
    pub counters: TransferCounters,
    /// When the file was written
    pub updated_at: DateTime<Utc>,
}

impl CheckpointFile {
    /// Read a restart file, `None` when it does not exist
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read checkpoint file {}: {}",
                    path.display(),
                    e
                ))
            }
        };
        let file = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse checkpoint file {}: {}", path.display(), e)
        })?;
        Ok(Some(file))
    }

    /// Check that the file belongs to this transfer
    pub fn ensure_matches(&self, source: &TableName, destination: &TableName) -> anyhow::Result<()> {
        if self.source_table != source.to_string() || self.destination_table != destination.to_string()
        {
            anyhow::bail!(
                "checkpoint was written for {} -> {}, not {} -> {}",
                self.source_table,
                self.destination_table,
                source,
                destination
            );
        }
        Ok(())
    }
}

/// Writes the latest checkpoint to a JSON file.
///
/// Each write goes to a sibling temporary file that is then renamed over the
/// target, so a crash leaves either the previous or the new checkpoint.
#[derive(Debug)]
pub struct FileCheckpointSink {
    path: PathBuf,
    source_table: String,
    destination_table: String,
}

impl FileCheckpointSink {
    /// Sink for one transfer
    pub fn new(path: impl Into<PathBuf>, source: &TableName, destination: &TableName) -> Self {
        Self {
            path: path.into(),
            source_table: source.to_string(),
            destination_table: destination.to_string(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn on_batch_committed(
        &self,
        partition: u32,
        last_key: &KeyTuple,
        counters: &TransferCounters,
    ) -> keyfill::Result<()> {
        let file = CheckpointFile {
            source_table: self.source_table.clone(),
            destination_table: self.destination_table.clone(),
            checkpoint: Checkpoint::new(partition, last_key.clone()),
            counters: *counters,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::internal(format!("failed to encode checkpoint: {}", e)))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &json).await.map_err(|e| {
            Error::internal(format!("failed to write {}: {}", temp.display(), e))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            Error::internal(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), checkpoint = %file.checkpoint, "checkpoint saved");
        Ok(())
    }
}

/// Remove a restart file after a completed run
pub fn remove(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed checkpoint file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to remove checkpoint file {}: {}",
            path.display(),
            e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableName {
        TableName::new(Some("dbo"), "orders")
    }

    fn key(id: i32) -> KeyTuple {
        KeyTuple::new(vec![Value::Int32(id)])
    }

    #[tokio::test]
    async fn test_sink_overwrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        let sink = FileCheckpointSink::new(&path, &orders(), &orders());

        let mut counters = TransferCounters {
            rows_fetched: 100,
            batches_completed: 1,
            ..Default::default()
        };
        sink.on_batch_committed(1, &key(100), &counters).await.unwrap();
        counters.rows_fetched = 200;
        counters.batches_completed = 2;
        sink.on_batch_committed(3, &key(200), &counters).await.unwrap();

        let file = CheckpointFile::load(&path).unwrap().unwrap();
        assert_eq!(file.checkpoint, Checkpoint::new(3, key(200)));
        assert_eq!(file.counters.batches_completed, 2);
        assert_eq!(file.source_table, "dbo.orders");
        assert!(!sink.temp_path().exists());
    }

    #[tokio::test]
    async fn test_typed_keys_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typed.json");
        let sink = FileCheckpointSink::new(&path, &orders(), &orders());
        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let keys = KeyTuple::new(vec![Value::Date(day), Value::String("EMEA".into())]);

        sink.on_batch_committed(2, &keys, &TransferCounters::default())
            .await
            .unwrap();

        let file = CheckpointFile::load(&path).unwrap().unwrap();
        assert_eq!(file.checkpoint.keys.values()[0], Value::Date(day));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointFile::load(&dir.path().join("absent.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CheckpointFile::load(&path).is_err());
    }

    #[test]
    fn test_checkpoint_for_other_table_rejected() {
        let file = CheckpointFile {
            source_table: "dbo.orders".into(),
            destination_table: "dbo.orders".into(),
            checkpoint: Checkpoint::new(1, key(5)),
            counters: TransferCounters::default(),
            updated_at: Utc::now(),
        };
        assert!(file.ensure_matches(&orders(), &orders()).is_ok());
        assert!(file
            .ensure_matches(&TableName::new(Some("dbo"), "invoices"), &orders())
            .is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.json");
        std::fs::write(&path, "{}").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
