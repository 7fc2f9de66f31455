//! Daily size of a ranked listing that never reports its total (e.g. the
//! number of ranked users), found by boundary probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{JobConfig, JobDefaults};
use crate::pipeline::checkpoint::Precheck;
use crate::pipeline::error::SourceError;
use crate::pipeline::probe::{probe, ProbeConfig};
use crate::pipeline::source::{ItemSource, Page, SourceRecord};
use crate::pipeline::{
    BatchKey, Driver, Fetcher, Job, PartitionKey, PersistedRecord, PipelineContext, PipelineError,
    RetryPolicy, RunScope, Transformed,
};
use crate::sources::http::JsonPageSource;
use crate::store::RecordQuery;

pub const DEFAULTS: JobDefaults = JobDefaults {
    name: "list_size",
    cron: "0 0 1 * * *",
    page_size: 20,
    bulk_size: 1,
    timeout_secs: 600,
    max_records: None,
};

pub fn build(cfg: JobConfig, ctx: &PipelineContext) -> Arc<dyn Job> {
    let listing = JsonPageSource::new(cfg.source.clone());
    let source = ProbeSource::new(listing, cfg.probe, ctx.retry.fresh());
    Arc::new(Driver::new(ListSizeFetcher::new(cfg, source), ctx.clone()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSize {
    pub total: u64,
    pub tries: u32,
}

impl SourceRecord for ListSize {
    fn record_id(&self) -> String {
        "total".into()
    }
}

/// Single-record source: the first page runs the boundary search over the
/// wrapped listing, later offsets are empty.
pub struct ProbeSource<S> {
    listing: S,
    cfg: ProbeConfig,
    retry: RetryPolicy,
}

impl<S: ItemSource> ProbeSource<S> {
    pub fn new(listing: S, cfg: ProbeConfig, retry: RetryPolicy) -> Self {
        Self {
            listing,
            cfg,
            retry,
        }
    }
}

fn into_source_error(err: PipelineError) -> SourceError {
    match err {
        PipelineError::Source(e) => e,
        other => SourceError::Other(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl<S: ItemSource> ItemSource for ProbeSource<S> {
    type Item = ListSize;

    fn page_size(&self) -> usize {
        1
    }

    async fn fetch_page(&self, offset: u64) -> Result<Page<ListSize>, SourceError> {
        if offset > 0 {
            return Ok(Page::empty());
        }
        let found = probe(&self.listing, self.cfg, &self.retry)
            .await
            .map_err(into_source_error)?;
        let size = ListSize {
            total: found.last_rank,
            tries: found.tries,
        };
        Ok(Page::new(vec![size], false))
    }
}

pub struct ListSizeFetcher<S> {
    cfg: JobConfig,
    source: Arc<ProbeSource<S>>,
}

impl<S> ListSizeFetcher<S> {
    pub fn new(cfg: JobConfig, source: ProbeSource<S>) -> Self {
        Self {
            cfg,
            source: Arc::new(source),
        }
    }
}

#[async_trait]
impl<S: ItemSource> Fetcher for ListSizeFetcher<S> {
    type Source = ProbeSource<S>;

    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn collection(&self) -> &str {
        &self.cfg.collection
    }

    fn cron(&self) -> &str {
        &self.cfg.cron
    }

    fn bulk_size(&self) -> usize {
        self.cfg.bulk_size.max(1)
    }

    fn timeout(&self) -> Duration {
        self.cfg.timeout
    }

    fn batch_key(&self, now: DateTime<Utc>) -> BatchKey {
        BatchKey::new(now.date_naive(), &self.cfg.kind)
    }

    fn source(&self) -> Arc<ProbeSource<S>> {
        self.source.clone()
    }

    /// One record per day; any stored record means the day is done.
    async fn should_fetch(&self, scope: &RunScope) -> Result<Precheck, PipelineError> {
        let existing = scope
            .store()
            .find_one(self.collection(), &RecordQuery::for_batch(&scope.batch))
            .await?;
        if existing.is_some() {
            let committed = scope.committed(self.collection()).await?;
            info!(batch = %scope.batch, "size already recorded");
            return Ok(Precheck::Skip { committed });
        }
        Ok(Precheck::Start)
    }

    async fn transform(&self, size: ListSize, scope: &RunScope) -> Result<Transformed, PipelineError> {
        info!(total = size.total, tries = size.tries, "listing size found");
        let payload = serde_json::json!({
            "date": scope.batch.date,
            "kind": scope.batch.kind,
            "total": size.total,
            "tries": size.tries,
            "fetched_at": scope.fetched_at.to_rfc3339(),
        });
        Ok(Transformed::record(PersistedRecord::new(
            scope.batch.clone(),
            PartitionKey::Id("total".into()),
            payload,
        )))
    }
}
