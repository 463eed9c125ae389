use std::sync::Arc;

use chrono::NaiveDate;
use hri_storage::ObjectStore;
use tracing::{info, instrument};

use crate::{AdapterError, LinePublisher, LineSource, MarkerLog, ObjectLineSource};

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub bucket: String,
    pub prefix: String,
    pub batch_size: usize,
}

/// Object key of the snapshot for `date`: `{prefix}/{YYYY-MM-DD}.jl`.
pub fn snapshot_key(prefix: &str, date: NaiveDate) -> String {
    let prefix = prefix.trim_matches('/');
    let file = format!("{}.jl", date.format("%Y-%m-%d"));
    if prefix.is_empty() {
        file
    } else {
        format!("{prefix}/{file}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    AlreadyProcessed,
    Published { lines: u64, batches: u64 },
}

/// Republishes a dated snapshot object onto the streaming transport.
pub struct SnapshotBridge {
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn LinePublisher>,
    markers: MarkerLog,
    config: SnapshotConfig,
}

impl SnapshotBridge {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn LinePublisher>,
        markers: MarkerLog,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            markers,
            config,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Publishes the object for `date` in batches. The `{bucket}/{key}` marker is
    /// written only after every batch was accepted; the first failing batch aborts
    /// the run and leaves the object to be republished next time.
    #[instrument(skip(self), fields(bucket = %self.config.bucket))]
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<BridgeOutcome, AdapterError> {
        let key = snapshot_key(&self.config.prefix, date);
        let marker = format!("{}/{}", self.config.bucket, key);
        if self.markers.contains(&marker).await? {
            info!(%marker, "snapshot already published, skipping");
            return Ok(BridgeOutcome::AlreadyProcessed);
        }

        let reader = self.store.open(&self.config.bucket, &key).await?;
        let mut source = ObjectLineSource::new(marker.clone(), reader);
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let (mut lines, mut batches) = (0u64, 0u64);

        while let Some(line) = source.next_line().await? {
            batch.push(line.bytes);
            lines += 1;
            if batch.len() >= batch_size {
                self.publisher.publish(&batch).await?;
                batches += 1;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.publisher.publish(&batch).await?;
            batches += 1;
        }

        self.markers.mark(&marker).await?;
        info!(%marker, lines, batches, "snapshot published");
        Ok(BridgeOutcome::Published { lines, batches })
    }
}
