//! Stream consumer
//!
//! Tails the change stream and drives the projections. One cooperating
//! worker per shard; within a shard records are delivered to the projector
//! strictly in stream order, one at a time. Across shards nothing is
//! ordered.
//!
//! The consumer never propagates errors upward. Transport problems put the
//! shard into `Recovering` with exponential backoff; undecodable records are
//! skipped (poison policy); projection failures are logged by the projector
//! and healed by re-delivery.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::EventEnvelope;
use crate::projection::Projector;

use super::checkpoint::CheckpointStore;
use super::{ChangeKind, ChangeRecord, ChangeStream, ShardId, ShardIterator, StreamPosition};

/// Where a shard cursor starts when no in-process position exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IteratorInit {
    /// Next record after subscription; cold start with fresh projections
    Latest,
    /// Oldest retained record; full rebuild
    TrimHorizon,
    /// Resume from the persisted per-shard checkpoint, falling back to the
    /// trim horizon when none exists
    #[default]
    AfterCheckpoint,
}

impl FromStr for IteratorInit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(IteratorInit::Latest),
            "trim_horizon" => Ok(IteratorInit::TrimHorizon),
            "after_checkpoint" => Ok(IteratorInit::AfterCheckpoint),
            other => Err(format!("unknown iterator init policy: {other}")),
        }
    }
}

/// Tuning knobs for the consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between shard polls
    pub poll_interval: Duration,
    /// Max records per fetch
    pub batch_limit: usize,
    /// Where to start on shard open
    pub iterator_init: IteratorInit,
    /// Per external call deadline
    pub call_timeout: Duration,
    /// How often the supervisor re-describes the stream for new shards
    pub rediscovery_interval: Duration,
    /// Initial backoff when a shard enters `Recovering`
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_limit: 100,
            iterator_init: IteratorInit::AfterCheckpoint,
            call_timeout: Duration::from_millis(5000),
            rediscovery_interval: Duration::from_millis(30_000),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Per-shard worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    Initializing,
    Polling,
    Recovering,
    Stopping,
    Stopped,
}

struct ShardWorker {
    shard_id: ShardId,
    stream: Arc<dyn ChangeStream>,
    checkpoints: Arc<dyn CheckpointStore>,
    projector: Arc<Projector>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
    /// Last sequence processed in this process; recovery resumes here even
    /// when the durable checkpoint lags.
    resume_seq: Option<i64>,
}

impl ShardWorker {
    async fn run(mut self) {
        let mut phase = ShardPhase::Initializing;
        let mut iterator: Option<ShardIterator> = None;
        let mut backoff = self.config.backoff_base;

        tracing::info!(shard = %self.shard_id, "shard worker started");

        loop {
            if *self.shutdown.borrow() && phase != ShardPhase::Stopped {
                phase = ShardPhase::Stopping;
            }

            match phase {
                ShardPhase::Initializing => match self.acquire_iterator().await {
                    Ok(it) => {
                        iterator = Some(it);
                        backoff = self.config.backoff_base;
                        phase = ShardPhase::Polling;
                    }
                    Err(error) => {
                        tracing::warn!(shard = %self.shard_id, %error, "iterator acquisition failed");
                        phase = ShardPhase::Recovering;
                    }
                },

                ShardPhase::Polling => {
                    let Some(current) = iterator.clone() else {
                        phase = ShardPhase::Initializing;
                        continue;
                    };

                    let fetched = tokio::time::timeout(
                        self.config.call_timeout,
                        self.stream.read_batch(&current, self.config.batch_limit),
                    )
                    .await;

                    let batch = match fetched {
                        Ok(Ok(batch)) => batch,
                        Ok(Err(error)) => {
                            tracing::warn!(shard = %self.shard_id, %error, "stream fetch failed");
                            phase = ShardPhase::Recovering;
                            continue;
                        }
                        Err(_) => {
                            tracing::warn!(shard = %self.shard_id, "stream fetch timed out");
                            phase = ShardPhase::Recovering;
                            continue;
                        }
                    };

                    // The in-flight batch is always finished, even when a
                    // shutdown arrives mid-way.
                    let last_sequence = batch.records.last().map(|r| r.sequence);
                    for record in batch.records {
                        self.handle_record(record).await;
                    }

                    if let Some(sequence) = last_sequence {
                        self.resume_seq = Some(sequence);
                        if let Err(error) = self.checkpoints.save(self.shard_id, sequence).await {
                            tracing::warn!(shard = %self.shard_id, %error, "checkpoint save failed");
                        }
                    }

                    match batch.next {
                        None => {
                            tracing::info!(shard = %self.shard_id, "shard closed, worker exiting");
                            phase = ShardPhase::Stopped;
                        }
                        Some(next) => {
                            iterator = Some(next);
                            self.idle(self.config.poll_interval).await;
                        }
                    }
                }

                ShardPhase::Recovering => {
                    self.idle(backoff).await;
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                    if !*self.shutdown.borrow() {
                        phase = ShardPhase::Initializing;
                    }
                }

                ShardPhase::Stopping => {
                    tracing::info!(shard = %self.shard_id, "shutdown signalled, worker stopping");
                    phase = ShardPhase::Stopped;
                }

                ShardPhase::Stopped => {
                    tracing::info!(shard = %self.shard_id, "shard worker stopped");
                    return;
                }
            }
        }
    }

    async fn acquire_iterator(&self) -> Result<ShardIterator, String> {
        let position = match self.resume_seq {
            // Mid-run recovery continues where this process left off.
            Some(sequence) => StreamPosition::AfterSequence(sequence),
            None => match self.config.iterator_init {
                IteratorInit::Latest => StreamPosition::Latest,
                IteratorInit::TrimHorizon => StreamPosition::TrimHorizon,
                IteratorInit::AfterCheckpoint => {
                    match self
                        .checkpoints
                        .load(self.shard_id)
                        .await
                        .map_err(|e| e.to_string())?
                    {
                        Some(sequence) => StreamPosition::AfterSequence(sequence),
                        None => StreamPosition::TrimHorizon,
                    }
                }
            },
        };

        tokio::time::timeout(
            self.config.call_timeout,
            self.stream.shard_iterator(self.shard_id, position),
        )
        .await
        .map_err(|_| "shard_iterator timed out".to_string())?
        .map_err(|e| e.to_string())
    }

    async fn handle_record(&self, record: ChangeRecord) {
        // The log is append-only; anything but an insert means the feed is
        // misconfigured.
        if record.kind != ChangeKind::Insert {
            tracing::warn!(
                shard = %self.shard_id,
                sequence = record.sequence,
                kind = ?record.kind,
                "ignoring non-insert change record"
            );
            return;
        }

        let envelope = match EventEnvelope::decode(record.event_data) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Poison message: re-delivery would fail identically, so the
                // record is skipped and surfaced to operators via the log.
                tracing::error!(
                    shard = %self.shard_id,
                    sequence = record.sequence,
                    %error,
                    "skipping undecodable stream record"
                );
                return;
            }
        };

        let report = self.projector.apply(&envelope).await;
        tracing::debug!(
            shard = %self.shard_id,
            sequence = record.sequence,
            event_id = %envelope.event_id,
            fully_applied = report.fully_applied(),
            "record dispatched"
        );
    }

    /// Sleep that wakes early on shutdown.
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

/// Supervisor: discovers shards, runs one worker per shard, and re-describes
/// the stream so splits and merges are picked up while running.
pub struct StreamConsumer {
    stream: Arc<dyn ChangeStream>,
    checkpoints: Arc<dyn CheckpointStore>,
    projector: Arc<Projector>,
    config: ConsumerConfig,
}

impl StreamConsumer {
    pub fn new(
        stream: Arc<dyn ChangeStream>,
        checkpoints: Arc<dyn CheckpointStore>,
        projector: Arc<Projector>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            stream,
            checkpoints,
            projector,
            config,
        }
    }

    /// Drop all checkpoints so the next run rebuilds from the trim horizon.
    pub async fn reset_checkpoints(&self) -> Result<(), super::CheckpointError> {
        self.checkpoints.reset_all().await
    }

    /// Run until the shutdown signal flips. Workers finish their in-flight
    /// batch before exiting.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut spawned: HashSet<ShardId> = HashSet::new();

        tracing::info!("stream consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.stream.list_shards().await {
                Ok(shards) => {
                    for shard_id in shards {
                        if spawned.insert(shard_id) {
                            let worker = ShardWorker {
                                shard_id,
                                stream: Arc::clone(&self.stream),
                                checkpoints: Arc::clone(&self.checkpoints),
                                projector: Arc::clone(&self.projector),
                                config: self.config.clone(),
                                shutdown: shutdown.clone(),
                                resume_seq: None,
                            };
                            workers.push(tokio::spawn(worker.run()));
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "stream description failed, will retry");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.rediscovery_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("waiting for shard workers to finish");
        for handle in workers {
            let _ = handle.await;
        }
        tracing::info!("stream consumer stopped");
    }
}
