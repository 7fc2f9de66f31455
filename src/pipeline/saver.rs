//! Batched persister.
//!
//! Buffers records in arrival order and writes them with one `insert_many`
//! per full batch. A failed flush leaves the buffer intact; nothing is
//! dropped silently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::pipeline::error::PipelineError;
use crate::pipeline::model::{BatchKey, PartitionKey, PersistedRecord};
use crate::store::{RecordQuery, Store};

/// Anything the driver can hand finished records to.
#[async_trait]
pub trait RecordSink: Send {
    async fn accept(&mut self, record: PersistedRecord) -> Result<(), PipelineError>;
}

pub struct Saver {
    store: Arc<dyn Store>,
    collection: String,
    bulk_size: usize,
    buffer: Vec<PersistedRecord>,
    seen: HashSet<(BatchKey, PartitionKey)>,
    data_count: usize,
    flushed: Arc<AtomicUsize>,
    flushes: usize,
    finalized: bool,
}

impl Saver {
    pub fn new(
        store: Arc<dyn Store>,
        collection: impl Into<String>,
        bulk_size: usize,
    ) -> Result<Self, PipelineError> {
        if bulk_size == 0 {
            return Err(PipelineError::Config("bulk size must be positive".into()));
        }
        Ok(Self {
            store,
            collection: collection.into(),
            bulk_size,
            buffer: Vec::with_capacity(bulk_size),
            seen: HashSet::new(),
            data_count: 0,
            flushed: Arc::new(AtomicUsize::new(0)),
            flushes: 0,
            finalized: false,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Records accepted by `add` during this run.
    pub fn data_count(&self) -> usize {
        self.data_count
    }

    /// Records committed to the store during this run.
    pub fn flushed_count(&self) -> usize {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Live view of `flushed_count`, readable after the saver has moved
    /// into another task.
    pub fn flushed_counter(&self) -> Arc<AtomicUsize> {
        self.flushed.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub async fn add(&mut self, record: PersistedRecord) -> Result<(), PipelineError> {
        if self.finalized {
            return Err(PipelineError::SaverFinalized(self.collection.clone()));
        }
        if !self.seen.insert((record.key.clone(), record.partition.clone())) {
            return Err(PipelineError::DuplicatePartitionKey {
                batch: record.key,
                partition: record.partition,
            });
        }
        self.buffer.push(record);
        self.data_count += 1;
        if self.buffer.len() >= self.bulk_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn add_many(
        &mut self,
        records: impl IntoIterator<Item = PersistedRecord>,
    ) -> Result<(), PipelineError> {
        for record in records {
            self.add(record).await?;
        }
        Ok(())
    }

    /// Direct store lookup; the buffer is not consulted.
    pub async fn exists_by_query(&self, query: &RecordQuery) -> Result<bool, PipelineError> {
        Ok(self
            .store
            .find_one(&self.collection, query)
            .await?
            .is_some())
    }

    /// Write the buffer as one batch. On failure the buffer is kept.
    #[instrument(skip(self), fields(collection = %self.collection, rows = self.buffer.len()))]
    pub async fn flush(&mut self) -> Result<usize, PipelineError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.store
            .insert_many(&self.collection, &self.buffer)
            .await?;
        let written = self.buffer.len();
        self.buffer.clear();
        let total = self.flushed.fetch_add(written, Ordering::Relaxed) + written;
        self.flushes += 1;
        debug!(written, total, "flushed batch");
        Ok(written)
    }

    /// Last flush; afterwards `add` is rejected. Calling it twice is harmless.
    pub async fn finalize(&mut self) -> Result<usize, PipelineError> {
        let written = self.flush().await?;
        self.finalized = true;
        Ok(written)
    }
}

#[async_trait]
impl RecordSink for Saver {
    async fn accept(&mut self, record: PersistedRecord) -> Result<(), PipelineError> {
        self.add(record).await
    }
}
