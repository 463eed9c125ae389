//! Line sources feeding the ingestion pipeline, the processed-source marker
//! log, and the publishing side of the snapshot bridge.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hri_storage::{ObjectReader, ObjectStoreError};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

mod ack;
#[cfg(feature = "kafka")]
mod kafka;
mod snapshot;

#[cfg(feature = "kafka")]
pub use kafka::{ensure_topic, KafkaLineSource, KafkaPublisher};
pub use ack::OffsetTracker;
pub use snapshot::{snapshot_key, BridgeOutcome, SnapshotBridge, SnapshotConfig};

pub const CRATE_NAME: &str = "hri-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {source_id}: {err}")]
    Read {
        source_id: String,
        #[source]
        err: io::Error,
    },
    #[error("marker log {}: {err}", .path.display())]
    Marker {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("publishing batch failed: {0}")]
    Publish(String),
    #[error("topic {topic}: {reason}")]
    Topic { topic: String, reason: String },
    #[cfg(feature = "kafka")]
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// One non-blank line, without its terminator. `number` is 1-based and counts
/// blank lines too, so it matches what an editor shows.
#[derive(Debug)]
pub struct RawLine {
    pub number: u64,
    pub bytes: Vec<u8>,
    /// Set by sources that redeliver unacknowledged lines.
    pub ack: Option<LineAck>,
}

/// Settles one delivered line. Commit it once the line's record reached a final
/// outcome that must not be redelivered; dropping it leaves the line pending.
pub struct LineAck(Box<dyn FnOnce() -> Result<(), AdapterError> + Send>);

impl LineAck {
    pub fn new(commit: impl FnOnce() -> Result<(), AdapterError> + Send + 'static) -> Self {
        Self(Box::new(commit))
    }

    pub fn commit(self) -> Result<(), AdapterError> {
        (self.0)()
    }
}

impl fmt::Debug for LineAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LineAck")
    }
}

#[async_trait]
pub trait LineSource: Send {
    /// Identifier recorded in the marker log once the source is fully processed.
    fn source_id(&self) -> &str;

    /// Next non-blank line, or `None` once the source is exhausted.
    async fn next_line(&mut self) -> Result<Option<RawLine>, AdapterError>;
}

/// Connection settings for the streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    pub commit_interval: Duration,
}

impl KafkaSettings {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

struct LineReader {
    source_id: String,
    reader: ObjectReader,
    number: u64,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(source_id: String, reader: ObjectReader) -> Self {
        Self {
            source_id,
            reader,
            number: 0,
            buf: Vec::with_capacity(4 * 1024),
        }
    }

    async fn next_line(&mut self) -> Result<Option<RawLine>, AdapterError> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|err| AdapterError::Read {
                    source_id: self.source_id.clone(),
                    err,
                })?;
            if read == 0 {
                return Ok(None);
            }
            self.number += 1;

            let mut end = self.buf.len();
            while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let line = &self.buf[..end];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(RawLine {
                number: self.number,
                bytes: line.to_vec(),
                ack: None,
            }));
        }
    }
}

/// Newline-delimited local file. Its source id is the file name.
pub struct FileSource {
    path: PathBuf,
    lines: LineReader,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref().to_path_buf();
        let source_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = fs::File::open(&path)
            .await
            .map_err(|err| AdapterError::Read {
                source_id: source_id.clone(),
                err,
            })?;
        Ok(Self {
            path,
            lines: LineReader::new(source_id, Box::pin(BufReader::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LineSource for FileSource {
    fn source_id(&self) -> &str {
        &self.lines.source_id
    }

    async fn next_line(&mut self) -> Result<Option<RawLine>, AdapterError> {
        self.lines.next_line().await
    }
}

/// Lines streamed from an object-storage body.
pub struct ObjectLineSource {
    lines: LineReader,
}

impl ObjectLineSource {
    pub fn new(source_id: impl Into<String>, reader: ObjectReader) -> Self {
        Self {
            lines: LineReader::new(source_id.into(), reader),
        }
    }
}

#[async_trait]
impl LineSource for ObjectLineSource {
    fn source_id(&self) -> &str {
        &self.lines.source_id
    }

    async fn next_line(&mut self) -> Result<Option<RawLine>, AdapterError> {
        self.lines.next_line().await
    }
}

/// Append-only log of fully processed source ids, one per line.
///
/// Not transactional with the review writes: a crash between the last write and
/// `mark` means the source is processed again, which record-level dedup absorbs.
#[derive(Debug, Clone)]
pub struct MarkerLog {
    path: PathBuf,
}

impl MarkerLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, source_id: &str) -> Result<bool, AdapterError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text.lines().any(|line| line.trim() == source_id)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.marker_error(err)),
        }
    }

    pub async fn mark(&self, source_id: &str) -> Result<(), AdapterError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.marker_error(err))?;
        file.write_all(format!("{source_id}\n").as_bytes())
            .await
            .map_err(|err| self.marker_error(err))?;
        file.flush().await.map_err(|err| self.marker_error(err))?;
        debug!(source = source_id, path = %self.path.display(), "marked source processed");
        Ok(())
    }

    fn marker_error(&self, err: io::Error) -> AdapterError {
        AdapterError::Marker {
            path: self.path.clone(),
            err,
        }
    }
}

#[async_trait]
pub trait LinePublisher: Send + Sync {
    /// Publishes one batch; an error means the batch may be partially delivered.
    async fn publish(&self, batch: &[Vec<u8>]) -> Result<(), AdapterError>;
}

/// Collects published batches in memory. Can be told to fail a given batch.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
    fail_at_batch: Option<usize>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the batch with this zero-based index.
    pub fn failing_at(batch_index: usize) -> Self {
        Self {
            batches: Mutex::default(),
            fail_at_batch: Some(batch_index),
        }
    }

    pub fn batches(&self) -> Vec<Vec<Vec<u8>>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl LinePublisher for MemoryPublisher {
    async fn publish(&self, batch: &[Vec<u8>]) -> Result<(), AdapterError> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fail_at_batch == Some(batches.len()) {
            return Err(AdapterError::Publish(format!(
                "batch {} rejected",
                batches.len()
            )));
        }
        batches.push(batch.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(source: &mut dyn LineSource) -> Vec<(u64, String)> {
        let mut out = Vec::new();
        while let Some(line) = source.next_line().await.expect("line") {
            out.push((line.number, String::from_utf8(line.bytes).expect("utf8")));
        }
        out
    }

    #[tokio::test]
    async fn file_source_skips_blank_lines_and_strips_terminators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agoda_com_2025-04-10.jl");
        std::fs::write(&path, "{\"a\":1}\r\n\n   \n{\"a\":2}").expect("write");

        let mut source = FileSource::open(&path).await.expect("open");
        assert_eq!(source.source_id(), "agoda_com_2025-04-10.jl");
        assert_eq!(
            collect(&mut source).await,
            vec![(1, "{\"a\":1}".to_string()), (4, "{\"a\":2}".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileSource::open(dir.path().join("absent.jl")).await.err().expect("error");
        assert!(matches!(err, AdapterError::Read { .. }));
    }

    #[tokio::test]
    async fn object_source_reads_any_buffered_reader() {
        let reader: ObjectReader = Box::pin(Cursor::new(b"x\ny\n".to_vec()));
        let mut source = ObjectLineSource::new("bucket/daily/2025-04-10.jl", reader);
        assert_eq!(source.source_id(), "bucket/daily/2025-04-10.jl");
        assert_eq!(collect(&mut source).await.len(), 2);
    }

    #[test]
    fn line_ack_runs_its_commit_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        let ack = LineAck::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        ack.commit().expect("commit");
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        let dropped = commits.clone();
        drop(LineAck::new(move || {
            dropped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn marker_log_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = MarkerLog::new(dir.path().join("processed.log"));

        assert!(!log.contains("a.jl").await.expect("missing log is empty"));
        log.mark("a.jl").await.expect("mark");
        log.mark("b.jl").await.expect("mark");

        assert!(log.contains("a.jl").await.expect("contains"));
        assert!(log.contains("b.jl").await.expect("contains"));
        assert!(!log.contains("c.jl").await.expect("contains"));
        let text = std::fs::read_to_string(log.path()).expect("read");
        assert_eq!(text, "a.jl\nb.jl\n");
    }

    #[tokio::test]
    async fn memory_publisher_fails_requested_batch() {
        let publisher = MemoryPublisher::failing_at(1);
        publisher.publish(&[b"a".to_vec()]).await.expect("first");
        assert!(publisher.publish(&[b"b".to_vec()]).await.is_err());
        assert_eq!(publisher.batch_sizes(), vec![1]);
    }
}
