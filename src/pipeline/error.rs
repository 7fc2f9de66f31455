//! Error taxonomy for collector runs.
//!
//! [`SourceError`] is what an item source reports; [`PipelineError`] is what
//! the driver reasons about when deciding whether a run keeps going, fails,
//! or skips.

use std::time::Duration;

use crate::pipeline::model::{BatchKey, PartitionKey};
use crate::pipeline::retry::Transient;
use crate::store::StoreError;

/// Failures reported by an item source (HTTP client, fixture, ...).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    /// The resource is gone (deleted, banned, private).
    #[error("resource unavailable: {0}")]
    Unavailable(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if e.is_connect() {
            return Self::Connect(e.to_string());
        }
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 => Self::RateLimited { retry_after: None },
            Some(status) => Self::Http {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => Self::Other(anyhow::Error::new(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// A stored identifier never changes; a different one for the same key
    /// means two upstream entities collided.
    #[error("entity {kind}/{key}: identifier conflict (stored {stored}, incoming {incoming})")]
    IdentifierConflict {
        kind: String,
        key: String,
        stored: i64,
        incoming: i64,
    },

    #[error("duplicate partition key ({partition}) in batch {batch}")]
    DuplicatePartitionKey {
        batch: BatchKey,
        partition: PartitionKey,
    },

    #[error("boundary search did not converge after {tries} tries (offset {offset}, step {step})")]
    ProbeDidNotConverge { tries: u32, offset: u64, step: u64 },

    #[error("{fetcher}: batch {batch} has {committed} records but the source cannot resume")]
    ResumeUnsupported {
        fetcher: String,
        batch: BatchKey,
        committed: u64,
    },

    #[error("saver for {0} is finalized; add() is not allowed")]
    SaverFinalized(String),

    #[error("run exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The run ended normally but `is_success` found nothing committed.
    #[error("no data committed for batch {0}")]
    EmptyBatch(BatchKey),

    /// A spawned worker died or stopped early.
    #[error("worker task failed: {0}")]
    Worker(String),

    /// A single record failed to transform or enrich.
    #[error("item {item}: {source}")]
    Item {
        item: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn item(item: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Item {
            item: item.into(),
            source: source.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Source(e) if e.is_rate_limit())
    }

    /// Errors that abort the whole run rather than the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::IdentifierConflict { .. }
                | Self::DuplicatePartitionKey { .. }
                | Self::SaverFinalized(_)
                | Self::ProbeDidNotConverge { .. }
                | Self::ResumeUnsupported { .. }
                | Self::Config(_)
                | Self::Worker(_)
        )
    }

    /// Store write failures; the buffer cannot be flushed after these.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl Transient for PipelineError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Source(e) => e.is_transient(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Source(e) => e.retry_after(),
            _ => None,
        }
    }
}
