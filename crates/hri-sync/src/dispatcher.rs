use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use hri_adapters::LineAck;
use hri_core::ReviewRecord;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal state of one record after it left the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
    Failed(String),
}

#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    /// Processes one record. Failures are returned, never raised.
    async fn handle(&self, record: ReviewRecord) -> RecordOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub inserted: u64,
    pub duplicates: u64,
    pub failed: u64,
    /// Deliveries settled with their source after `Inserted` or `Duplicate`.
    pub acknowledged: u64,
    /// Records still queued when the drain deadline passed.
    pub abandoned: u64,
    /// Workers aborted mid-record at the drain deadline.
    pub aborted_workers: u64,
}

impl DispatchReport {
    pub fn processed(&self) -> u64 {
        self.inserted + self.duplicates + self.failed
    }

    /// True when every submitted record reached `Inserted` or `Duplicate`.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.abandoned == 0 && self.aborted_workers == 0
    }

    fn absorb(&mut self, other: DispatchReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.acknowledged += other.acknowledged;
        self.abandoned += other.abandoned;
        self.aborted_workers += other.aborted_workers;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    Cancelled,
    #[error("dispatch queue is closed")]
    Closed,
}

struct Job {
    record: ReviewRecord,
    ack: Option<LineAck>,
}

/// Fixed pool of workers draining a bounded queue.
///
/// `submit` waits while the queue is full. Workers share nothing but the
/// handler; each record's outcome, including a panic, stays inside its worker.
/// A record's [`LineAck`] is committed only after it ended `Inserted` or
/// `Duplicate`; failed, aborted and abandoned records drop theirs.
pub struct Dispatcher {
    sender: async_channel::Sender<Job>,
    receiver: async_channel::Receiver<Job>,
    workers: Vec<JoinHandle<DispatchReport>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn spawn(
        config: DispatcherConfig,
        handler: Arc<dyn RecordHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = async_channel::bounded(config.queue_capacity.max(1));
        let workers = (0..config.workers.max(1))
            .map(|worker| tokio::spawn(worker_loop(worker, receiver.clone(), handler.clone())))
            .collect();
        debug!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity.max(1),
            "dispatcher started"
        );
        Self {
            sender,
            receiver,
            workers,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Enqueues a record, waiting for room. Fails once cancellation was requested;
    /// a record that was not enqueued drops its `ack`.
    pub async fn submit(
        &self,
        record: ReviewRecord,
        ack: Option<LineAck>,
    ) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let job = Job { record, ack };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DispatchError::Cancelled),
            sent = self.sender.send(job) => sent.map_err(|_| DispatchError::Closed),
        }
    }

    /// Closes the queue and waits for every worker to finish.
    pub async fn finish(self) -> DispatchReport {
        self.sender.close();
        self.join(None).await
    }

    /// Cancels, closes the queue, and gives the workers `timeout` to drain it.
    /// Workers still running afterwards are aborted.
    pub async fn shutdown(self, timeout: Duration) -> DispatchReport {
        self.cancel.cancel();
        self.sender.close();
        self.join(Some(Instant::now() + timeout)).await
    }

    async fn join(mut self, deadline: Option<Instant>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut timed_out = false;
        for mut worker in self.workers.drain(..) {
            // A finished worker still yields its tally after the deadline.
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut worker).await.ok(),
                None => Some((&mut worker).await),
            };
            match joined {
                Some(Ok(tally)) => report.absorb(tally),
                Some(Err(err)) => error!(error = %err, "dispatcher worker did not complete"),
                None => {
                    timed_out = true;
                    worker.abort();
                    report.aborted_workers += 1;
                }
            }
        }
        if timed_out {
            report.abandoned = self.receiver.len() as u64;
            warn!(
                aborted_workers = report.aborted_workers,
                abandoned = report.abandoned,
                "drain deadline passed"
            );
        }
        report
    }
}

async fn worker_loop(
    worker: usize,
    receiver: async_channel::Receiver<Job>,
    handler: Arc<dyn RecordHandler>,
) -> DispatchReport {
    let mut tally = DispatchReport::default();
    while let Ok(Job { record, ack }) = receiver.recv().await {
        let hotel_review_id = record.hotel_review_id;
        let outcome = AssertUnwindSafe(handler.handle(record))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| RecordOutcome::Failed(panic_message(panic.as_ref())));
        match outcome {
            RecordOutcome::Inserted => {
                tally.inserted += 1;
                settle(worker, hotel_review_id, ack, &mut tally);
            }
            RecordOutcome::Duplicate => {
                debug!(worker, hotel_review_id, "duplicate review skipped");
                tally.duplicates += 1;
                settle(worker, hotel_review_id, ack, &mut tally);
            }
            RecordOutcome::Failed(reason) => {
                error!(worker, hotel_review_id, %reason, "record failed");
                tally.failed += 1;
                if ack.is_some() {
                    debug!(worker, hotel_review_id, "delivery left for redelivery");
                }
            }
        }
    }
    tally
}

fn settle(worker: usize, hotel_review_id: i64, ack: Option<LineAck>, tally: &mut DispatchReport) {
    let Some(ack) = ack else {
        return;
    };
    match ack.commit() {
        Ok(()) => tally.acknowledged += 1,
        Err(err) => warn!(worker, hotel_review_id, error = %err, "acknowledging delivery failed"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panicked: {detail}")
}
