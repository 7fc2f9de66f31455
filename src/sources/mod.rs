//! Item sources the jobs read from.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::pipeline::error::SourceError;

/// Single-object lookup keyed by an entity key, used to enrich records.
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn detail(&self, key: &str) -> Result<Value, SourceError>;
}
