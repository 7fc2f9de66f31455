//! Run-start precheck: how much of a batch is already committed.

use std::sync::Arc;

use tracing::{info, warn};

use crate::pipeline::error::PipelineError;
use crate::pipeline::model::{BatchKey, PartitionKey};
use crate::store::{RecordQuery, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precheck {
    /// The batch is complete; the run ends without side effects.
    Skip { committed: u64 },
    /// Partial batch: restart the source at this 0-based offset. Records
    /// already in the store are filtered out before they are saved.
    Resume { offset: u64, committed: u64 },
    Start,
}

/// What a batch holds before the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Committed {
    pub count: u64,
    /// Highest stored rank, when the batch is keyed by rank.
    pub highest_rank: Option<u64>,
}

impl Committed {
    /// Right after the stored ranks when they form a `1..=count` prefix.
    /// Otherwise a rank is missing somewhere and the walk restarts from the
    /// top.
    pub fn resume_offset(&self) -> u64 {
        match self.highest_rank {
            Some(highest) if highest == self.count => self.count,
            _ => 0,
        }
    }
}

/// `expected` is the known batch size, or `None` for open-ended sources.
/// Open-ended batches resume when the source can, and count as complete
/// on any data when it cannot.
pub fn decide(committed: Committed, expected: Option<u64>, resumable: bool) -> Precheck {
    let resume = Precheck::Resume {
        offset: committed.resume_offset(),
        committed: committed.count,
    };
    match (committed.count, expected) {
        (0, _) => Precheck::Start,
        (n, Some(total)) if n < total => resume,
        (_, None) if resumable => resume,
        (n, _) => Precheck::Skip { committed: n },
    }
}

/// Reads the committed state once per run. It never caches: a checkpoint
/// written by this run is only seen by the next one.
pub struct CheckpointController {
    store: Arc<dyn Store>,
}

impl CheckpointController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn committed(&self, collection: &str, key: &BatchKey) -> Result<u64, PipelineError> {
        Ok(self.store.count_by_key(collection, key).await?)
    }

    pub async fn snapshot(&self, collection: &str, key: &BatchKey) -> Result<Committed, PipelineError> {
        let count = self.committed(collection, key).await?;
        if count == 0 {
            return Ok(Committed::default());
        }
        let top = self
            .store
            .find_one(collection, &RecordQuery::for_batch(key))
            .await?;
        let highest_rank = match top.map(|record| record.partition) {
            Some(PartitionKey::Rank(rank)) => Some(rank),
            _ => None,
        };
        Ok(Committed {
            count,
            highest_rank,
        })
    }

    pub async fn precheck(
        &self,
        collection: &str,
        key: &BatchKey,
        expected: Option<u64>,
        resumable: bool,
    ) -> Result<Precheck, PipelineError> {
        let committed = self.snapshot(collection, key).await?;
        let decision = decide(committed, expected, resumable);
        match decision {
            Precheck::Skip { committed } => {
                info!(collection, batch = %key, committed, "batch already committed")
            }
            Precheck::Resume { offset, .. } => warn!(
                collection,
                batch = %key,
                committed = committed.count,
                highest_rank = ?committed.highest_rank,
                offset,
                expected = ?expected,
                "partial batch found; resuming"
            ),
            Precheck::Start => {}
        }
        Ok(decision)
    }
}
