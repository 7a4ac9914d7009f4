//! In-memory change stream
//!
//! Tails the shard buffers of a `MemoryEventLog`. Beyond the port contract
//! it offers test controls: closing a shard and scheduling transient read
//! failures, so the consumer's recovery and shutdown paths can be exercised
//! without a real feed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::event_log::MemoryEventLog;

use super::{
    ChangeStream, RecordBatch, ShardId, ShardIterator, StreamError, StreamPosition,
};

/// Change feed over an in-memory event log.
#[derive(Clone)]
pub struct MemoryChangeStream {
    log: MemoryEventLog,
    closed: Arc<Mutex<HashSet<ShardId>>>,
    fail_reads: Arc<Mutex<HashMap<ShardId, u32>>>,
}

impl MemoryChangeStream {
    pub fn new(log: MemoryEventLog) -> Self {
        Self {
            log,
            closed: Arc::new(Mutex::new(HashSet::new())),
            fail_reads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mark a shard closed: remaining records are still drained, then
    /// `read_batch` reports no next iterator.
    pub fn close_shard(&self, shard_id: ShardId) {
        self.closed
            .lock()
            .expect("stream lock poisoned")
            .insert(shard_id);
    }

    /// Make the next `count` reads on a shard fail with a transport error.
    pub fn fail_next_reads(&self, shard_id: ShardId, count: u32) {
        self.fail_reads
            .lock()
            .expect("stream lock poisoned")
            .insert(shard_id, count);
    }

    fn take_scheduled_failure(&self, shard_id: ShardId) -> bool {
        let mut failures = self.fail_reads.lock().expect("stream lock poisoned");
        match failures.get_mut(&shard_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn is_closed(&self, shard_id: ShardId) -> bool {
        self.closed
            .lock()
            .expect("stream lock poisoned")
            .contains(&shard_id)
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn list_shards(&self) -> Result<Vec<ShardId>, StreamError> {
        Ok((0..self.log.shard_count()).map(ShardId).collect())
    }

    async fn shard_iterator(
        &self,
        shard_id: ShardId,
        position: StreamPosition,
    ) -> Result<ShardIterator, StreamError> {
        if shard_id.0 >= self.log.shard_count() {
            return Err(StreamError::UnknownShard(shard_id));
        }

        let after_seq = match position {
            StreamPosition::TrimHorizon => 0,
            StreamPosition::Latest => self.log.latest_seq(shard_id),
            StreamPosition::AfterSequence(seq) => seq,
        };

        Ok(ShardIterator { shard_id, after_seq })
    }

    async fn read_batch(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, StreamError> {
        if self.take_scheduled_failure(iterator.shard_id) {
            return Err(StreamError::Transport(
                "injected read failure".to_string(),
            ));
        }

        let records = self
            .log
            .read_shard(iterator.shard_id, iterator.after_seq, limit);

        let drained = records.len() < limit;
        let after_seq = records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(iterator.after_seq);

        // A closed shard keeps handing out records until drained, then
        // reports no next iterator.
        let next = if self.is_closed(iterator.shard_id) && drained {
            None
        } else {
            Some(ShardIterator {
                shard_id: iterator.shard_id,
                after_seq,
            })
        };

        Ok(RecordBatch { records, next })
    }
}
