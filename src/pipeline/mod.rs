//! Incremental collection engine shared by every job.
//!
//! Leaf-first: [`retry`], [`saver`], [`reconcile`], [`checkpoint`],
//! [`probe`], [`source`], then the [`fetcher`] driver tying them together.

pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod fetcher;
pub mod guard;
pub mod model;
pub mod notify;
pub mod probe;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod retry;
pub mod saver;
pub mod source;

pub use error::{PipelineError, SourceError};
pub use fetcher::{
    Driver, EntityAction, ExecutionMode, Fetcher, Job, PipelineContext, RunScope, Transformed,
};
pub use model::{BatchKey, Entity, EntityStatus, EntityUpdate, PartitionKey, PersistedRecord};
pub use registry::Registry;
pub use report::{RunOutcome, RunReport};
pub use retry::RetryPolicy;
