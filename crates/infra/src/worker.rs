//! Worker Loop: long-polls one queue and dispatches to one processor.
//!
//! ## Per iteration
//!
//! 1. Receive up to `batch_size` messages, waiting up to `wait`
//! 2. Empty batch: sleep `empty_backoff`. Transport error: log, sleep `error_backoff`
//! 3. For every message:
//!    - malformed, or for another family: acknowledge and discard
//!    - processed, or failed with [`Disposition::Acknowledge`]: acknowledge
//!    - failed with [`Disposition::Retry`]: leave it; the queue redelivers it
//!      after the visibility timeout, and dead-letters it after too many tries
//!
//! Cancellation is observed during the long poll and the backoff sleeps. A
//! batch that has been received is always processed to the end.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use forgegen_jobs::JobMessage;

use crate::lock;
use crate::processor::{Disposition, JobProcessor, ProcessError};
use crate::queue::{JobQueue, QueueError, ReceivedMessage};

/// Upper bound on messages per receive.
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub wait: Duration,
    pub empty_backoff: Duration,
    pub error_backoff: Duration,
    /// Process a received batch concurrently instead of one message at a time.
    pub concurrent_dispatch: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            wait: Duration::from_secs(20),
            empty_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            concurrent_dispatch: false,
        }
    }
}

/// Loop runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    /// Deliveries received.
    pub received: u64,
    /// Deliveries deleted from the queue, whatever the outcome.
    pub acknowledged: u64,
    /// Malformed, orphaned or misrouted messages dropped without processing.
    pub discarded: u64,
    /// Jobs that ended `failed`.
    pub failed_jobs: u64,
    /// Deliveries left unacknowledged for redelivery.
    pub left_for_retry: u64,
    /// Receive calls that failed.
    pub transport_errors: u64,
    pub uptime_secs: u64,
}

enum Handled {
    Processed,
    Discarded,
    JobFailed,
    Retry,
}

pub struct WorkerLoop {
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    settings: WorkerSettings,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerLoop {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<dyn JobProcessor>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            processor,
            settings,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Run on the current task until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let span = info_span!("worker", queue = %self.queue.name(), job_type = %self.processor.job_type());
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.batch_size(),
            wait_ms = self.settings.wait.as_millis() as u64,
            concurrent = self.settings.concurrent_dispatch,
            "worker loop started"
        );
        let started = Instant::now();

        while !shutdown.is_cancelled() {
            // Only the receive races shutdown; a received batch is always dispatched.
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.receive() => received,
            };
            lock(&self.stats).uptime_secs = started.elapsed().as_secs();

            let pause = match received {
                Ok(batch) if batch.is_empty() => self.settings.empty_backoff,
                Ok(batch) => {
                    self.dispatch(batch).await;
                    continue;
                }
                Err(e) => {
                    lock(&self.stats).transport_errors += 1;
                    error!(error = %e, "failed to receive messages");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(stats = ?self.stats(), "worker loop stopped");
    }

    fn batch_size(&self) -> usize {
        self.settings.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    /// One receive + dispatch round. Returns the number of messages received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let batch = self.receive().await?;
        let count = batch.len();
        self.dispatch(batch).await;
        Ok(count)
    }

    async fn receive(&self) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.queue.receive(self.batch_size(), self.settings.wait).await
    }

    async fn dispatch(&self, batch: Vec<ReceivedMessage>) {
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "received messages");

        if self.settings.concurrent_dispatch {
            join_all(batch.into_iter().map(|m| self.handle(m))).await;
        } else {
            for message in batch {
                self.handle(message).await;
            }
        }
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await }.in_current_span());

        WorkerHandle { shutdown, join, stats }
    }

    #[instrument(name = "message", skip_all, fields(message_id = %message.message_id, receive_count = message.receive_count))]
    async fn handle(&self, message: ReceivedMessage) {
        lock(&self.stats).received += 1;

        let handled = self.process(&message).await;
        let acknowledged = !matches!(handled, Handled::Retry) && self.acknowledge(&message).await;

        let mut stats = lock(&self.stats);
        match handled {
            Handled::Processed => {}
            Handled::Discarded => stats.discarded += 1,
            Handled::JobFailed => stats.failed_jobs += 1,
            Handled::Retry => stats.left_for_retry += 1,
        }
        if acknowledged {
            stats.acknowledged += 1;
        }
    }

    async fn process(&self, message: &ReceivedMessage) -> Handled {
        let job = match JobMessage::decode(&message.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "discarding malformed message");
                return Handled::Discarded;
            }
        };

        let expected = self.processor.job_type();
        if job.job_type() != expected {
            warn!(job_id = %job.id, job_type = %job.job_type(), %expected, "discarding message for another job type");
            return Handled::Discarded;
        }

        debug!(job_id = %job.id, owner_id = %job.owner_id(), "processing job");
        match self.processor.process(&job).await {
            Ok(()) => Handled::Processed,
            Err(e) => classify(&job, e),
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> bool {
        match self.queue.acknowledge(&message.receipt).await {
            Ok(()) => true,
            Err(e) => {
                warn!(receipt = %message.receipt, error = %e, "failed to acknowledge message");
                false
            }
        }
    }
}

fn classify(job: &JobMessage, error: ProcessError) -> Handled {
    match (error.disposition(), &error) {
        (Disposition::Retry, _) => {
            warn!(job_id = %job.id, error = %error, "processing interrupted; leaving message for redelivery");
            Handled::Retry
        }
        (Disposition::Acknowledge, ProcessError::JobFailed { .. }) => {
            warn!(job_id = %job.id, error = %error, "job failed");
            Handled::JobFailed
        }
        (Disposition::Acknowledge, ProcessError::Superseded { .. }) => {
            info!(job_id = %job.id, error = %error, "job outcome already recorded by another delivery");
            Handled::Processed
        }
        (Disposition::Acknowledge, _) => {
            warn!(job_id = %job.id, error = %error, "discarding message");
            Handled::Discarded
        }
    }
}

/// Handle to a spawned loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Current loop statistics.
    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Ask the loop to stop without waiting.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop the loop and wait for in-flight processing to finish.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "worker loop task failed");
        }
        lock(&self.stats).clone()
    }
}
