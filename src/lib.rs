//! Incremental collection of paginated, ranked and event-style listings.
//!
//! [`pipeline`] is the engine every collector runs on, [`store`] the
//! persistence contract, [`sources`] the upstream readers and [`jobs`] the
//! concrete collectors wired from configuration.

pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod sources;
pub mod store;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}
