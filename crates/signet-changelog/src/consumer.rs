//! Consumer runtime: one worker task per (consumer group, partition).
//!
//! Each step reads a batch past the committed cursor, decodes it, hands the
//! decoded records to the group's [`ChangeHandler`], and commits the cursor
//! to the last position of the batch. The cursor only moves after the
//! handler succeeds, so a crash or a transient failure replays the batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use signet_db::DbPool;
use signet_types::ChangeRecord;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::decode::decode;
use crate::error::ConsumeError;
use crate::log::{commit_cursor, load_cursor, read_partition, LogHead};

/// Failure reported by a [`ChangeHandler`]. The batch is retried.
#[derive(Debug, thiserror::Error)]
#[error("transient handler failure: {0}")]
pub struct HandlerError(pub String);

/// Side effects applied by a consumer group.
///
/// Batches arrive in partition order. A batch may be delivered more than
/// once, so implementations must be idempotent.
pub trait ChangeHandler: Send + Sync + 'static {
    fn handle_batch(&self, records: &[ChangeRecord]) -> Result<(), HandlerError>;
}

/// Tunables for one consumer group.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub partitions: u32,
    pub batch_size: usize,
    /// Upper bound on how long an idle worker waits before re-reading.
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, partitions: u32) -> Self {
        Self {
            group: group.into(),
            partitions: partitions.max(1),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// Counters shared by every worker of a group.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    records: AtomicU64,
    malformed: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub records: u64,
    pub malformed: u64,
    pub batches: u64,
    pub retries: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Handles to a running consumer group.
#[derive(Debug)]
pub struct ConsumerGroupHandle {
    pub group: String,
    pub stats: Arc<ConsumerStats>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerGroupHandle {
    /// Waits for every worker to exit. Workers exit once the cancellation
    /// token passed to [`spawn_consumer_group`] fires.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(group = %self.group, "consumer worker join error: {}", e);
            }
        }
    }
}

struct Worker<H> {
    pool: DbPool,
    head: LogHead,
    handler: Arc<H>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
}

enum Step {
    Advanced { position: i64, records: usize },
    Idle,
}

/// Spawns one worker per partition for `config.group`.
pub fn spawn_consumer_group<H: ChangeHandler>(
    pool: DbPool,
    head: LogHead,
    handler: Arc<H>,
    config: ConsumerConfig,
    cancel: CancellationToken,
) -> ConsumerGroupHandle {
    let stats = Arc::new(ConsumerStats::default());
    let group = config.group.clone();
    let partitions = config.partitions;

    tracing::info!(group = %group, partitions, "starting consumer group");

    let worker = Arc::new(Worker {
        pool,
        head,
        handler,
        config,
        stats: Arc::clone(&stats),
        cancel,
    });

    let workers = (0..partitions)
        .map(|partition| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(partition).await })
        })
        .collect();

    ConsumerGroupHandle {
        group,
        stats,
        workers,
    }
}

impl<H: ChangeHandler> Worker<H> {
    async fn run(self: Arc<Self>, partition: u32) {
        let group = self.config.group.as_str();
        let mut head_rx = self.head.subscribe();
        let mut backoff = self.config.backoff_initial;

        tracing::debug!(group, partition, "consumer worker started");

        while !self.cancel.is_cancelled() {
            head_rx.borrow_and_update();

            match self.step(partition).await {
                Ok(Step::Advanced { position, records }) => {
                    backoff = self.config.backoff_initial;
                    tracing::debug!(group, partition, position, records, "committed batch");
                }
                Ok(Step::Idle) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        changed = head_rx.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep(self.config.poll_interval).await;
                            }
                        }
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        group,
                        partition,
                        backoff_ms = backoff.as_millis() as u64,
                        "consumer step failed, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }

        tracing::debug!(group, partition, "consumer worker stopped");
    }

    async fn step(self: &Arc<Self>, partition: u32) -> Result<Step, ConsumeError> {
        let worker = Arc::clone(self);
        tokio::task::spawn_blocking(move || worker.step_blocking(partition))
            .await
            .map_err(|e| ConsumeError::Join(e.to_string()))?
    }

    fn step_blocking(&self, partition: u32) -> Result<Step, ConsumeError> {
        let group = self.config.group.as_str();
        let conn = self.pool.get()?;

        let cursor = load_cursor(&conn, group, partition)?;
        let entries = read_partition(&conn, partition, cursor, self.config.batch_size)?;
        let Some(last) = entries.last() else {
            return Ok(Step::Idle);
        };
        let position = last.log_position;

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match decode(entry) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        group,
                        partition = e.partition,
                        position = e.position,
                        reason = %e.reason,
                        "discarding malformed change record"
                    );
                }
            }
        }

        if !records.is_empty() {
            self.handler.handle_batch(&records)?;
        }

        commit_cursor(&conn, group, partition, position)?;

        self.stats
            .records
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        Ok(Step::Advanced {
            position,
            records: records.len(),
        })
    }
}
