//! Store contract the pipeline writes through.
//!
//! Records are append-only and unique per `(collection, batch key, partition
//! key)`. Entities are keyed by `(kind, key)` and only change through
//! [`EntityPatch`]es computed by the reconciler.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::pipeline::model::{BatchKey, Entity, EntityPatch, PartitionKey, PersistedRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// Injected or backend-specific write failure.
    #[error("write failed: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Existence / lookup predicate. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub key: Option<BatchKey>,
    pub kind: Option<String>,
    pub partition: Option<PartitionKey>,
}

impl RecordQuery {
    pub fn for_batch(key: &BatchKey) -> Self {
        Self {
            key: Some(key.clone()),
            ..Self::default()
        }
    }

    pub fn for_partition(key: &BatchKey, partition: PartitionKey) -> Self {
        Self {
            key: Some(key.clone()),
            partition: Some(partition),
            ..Self::default()
        }
    }

    /// Every batch of one kind, across dates.
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &PersistedRecord) -> bool {
        if let Some(key) = &self.key {
            if &record.key != key {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &record.key.kind != kind {
                return false;
            }
        }
        if let Some(partition) = &self.partition {
            if &record.partition != partition {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert all records or none of them.
    async fn insert_many(&self, collection: &str, records: &[PersistedRecord]) -> Result<()>;

    async fn count_by_key(&self, collection: &str, key: &BatchKey) -> Result<u64>;

    /// Best match for `query`: the highest partition ordinal, ties broken by
    /// the most recent insert.
    async fn find_one(&self, collection: &str, query: &RecordQuery)
        -> Result<Option<PersistedRecord>>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, kind: &str, key: &str) -> Result<Option<Entity>>;

    /// Fails with [`StoreError::DuplicateKey`] when the entity already exists.
    async fn insert_entity(&self, entity: &Entity) -> Result<()>;

    async fn update_entity(&self, kind: &str, key: &str, patch: &EntityPatch) -> Result<()>;
}

/// Everything a collector run needs from persistence.
pub trait Store: RecordStore + EntityStore {}

impl<T: RecordStore + EntityStore> Store for T {}
