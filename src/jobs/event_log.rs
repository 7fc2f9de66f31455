//! Open-ended, newest-first event feeds (e.g. lottery wins).
//!
//! There is no fixed batch size, so there is nothing to resume: every run
//! starts at the head of the feed and stops at the newest event already
//! stored for this kind, or after `max_records`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::config::{JobConfig, JobDefaults};
use crate::pipeline::checkpoint::Precheck;
use crate::pipeline::source::ItemSource;
use crate::pipeline::{
    BatchKey, Driver, Fetcher, Job, PartitionKey, PersistedRecord, PipelineContext, PipelineError,
    RunScope, Transformed,
};
use crate::sources::http::{JsonPageSource, JsonRow};
use crate::store::RecordQuery;

pub const DEFAULTS: JobDefaults = JobDefaults {
    name: "event_log",
    cron: "0 0 2,9,14,21 * * *",
    page_size: 20,
    bulk_size: 100,
    timeout_secs: 900,
    max_records: Some(500),
};

pub fn build(cfg: JobConfig, ctx: &PipelineContext) -> Arc<dyn Job> {
    let source = JsonPageSource::new(cfg.source.clone());
    Arc::new(Driver::new(EventLogFetcher::new(cfg, source), ctx.clone()))
}

pub struct EventLogFetcher<S = JsonPageSource> {
    cfg: JobConfig,
    source: Arc<S>,
}

impl<S> EventLogFetcher<S> {
    pub fn new(cfg: JobConfig, source: S) -> Self {
        Self {
            cfg,
            source: Arc::new(source),
        }
    }

    fn stored_event(&self, id: &str) -> RecordQuery {
        RecordQuery {
            kind: Some(self.cfg.kind.clone()),
            partition: Some(PartitionKey::Id(id.to_string())),
            ..RecordQuery::default()
        }
    }
}

#[async_trait]
impl<S: ItemSource<Item = JsonRow>> Fetcher for EventLogFetcher<S> {
    type Source = S;

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
        self.cfg.bulk_size
    }

    fn timeout(&self) -> Duration {
        self.cfg.timeout
    }

    fn batch_key(&self, now: DateTime<Utc>) -> BatchKey {
        BatchKey::new(now.date_naive(), &self.cfg.kind)
    }

    fn max_records(&self) -> Option<usize> {
        self.cfg.max_records
    }

    fn source(&self) -> Arc<S> {
        self.source.clone()
    }

    /// Several runs a day write into the same batch.
    async fn should_fetch(&self, _scope: &RunScope) -> Result<Precheck, PipelineError> {
        Ok(Precheck::Start)
    }

    async fn stop_marker(&self, scope: &RunScope) -> Result<Option<String>, PipelineError> {
        let latest = scope
            .store()
            .find_one(self.collection(), &RecordQuery::for_kind(&self.cfg.kind))
            .await?;
        Ok(latest.map(|record| match record.partition {
            PartitionKey::Id(id) => id,
            PartitionKey::Rank(rank) => rank.to_string(),
        }))
    }

    /// Guards against feeds that reorder or drop the marker event.
    async fn should_save(&self, row: &JsonRow, scope: &RunScope) -> Result<bool, PipelineError> {
        let existing = scope
            .store()
            .find_one(self.collection(), &self.stored_event(&row.id))
            .await?;
        if existing.is_some() {
            debug!(event = %row.id, "event already stored");
        }
        Ok(existing.is_none())
    }

    async fn transform(&self, row: JsonRow, scope: &RunScope) -> Result<Transformed, PipelineError> {
        let payload = json!({
            "id": row.id,
            "fetched_at": scope.fetched_at.to_rfc3339(),
            "data": row.data,
        });
        Ok(Transformed::record(PersistedRecord::new(
            scope.batch.clone(),
            PartitionKey::Id(row.id),
            payload,
        )))
    }

    /// An empty delta is a normal outcome for a feed.
    async fn is_success(&self, _scope: &RunScope, _saved: usize) -> Result<bool, PipelineError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::FixedClock;
    use crate::pipeline::{RetryPolicy, RunOutcome};
    use crate::sources::http::HttpSourceConfig;
    use crate::sources::memory::MemorySource;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    fn cfg(max_records: usize) -> JobConfig {
        JobConfig {
            prefix: "EVENT_LOG".into(),
            name: "lottery_wins".into(),
            collection: "records".into(),
            kind: "lottery_wins".into(),
            cron: DEFAULTS.cron.into(),
            bulk_size: 25,
            timeout: Duration::from_secs(30),
            expected_total: None,
            max_records: Some(max_records),
            source: HttpSourceConfig::new("http://unused.invalid", 10),
            entity: None,
            detail: None,
            probe: Default::default(),
        }
    }

    /// Newest first: ids `newest..=oldest` descending.
    fn feed(newest: u64, oldest: u64) -> MemorySource<JsonRow> {
        let rows = (oldest..=newest)
            .rev()
            .enumerate()
            .map(|(i, id)| JsonRow {
                rank: i as u64 + 1,
                id: id.to_string(),
                data: json!({"winner": format!("w{id}")}),
            })
            .collect();
        MemorySource::new(rows, 10)
    }

    fn ctx(store: &Arc<MemoryStore>, hour: u32) -> PipelineContext {
        PipelineContext::new(store.clone())
            .with_retry(RetryPolicy::none())
            .with_clock(Arc::new(FixedClock(at(hour))))
    }

    fn stored_ids(store: &MemoryStore) -> Vec<String> {
        store
            .records("records")
            .into_iter()
            .map(|r| match r.partition {
                PartitionKey::Id(id) => id,
                PartitionKey::Rank(rank) => rank.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn first_run_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let report = Driver::new(EventLogFetcher::new(cfg(30), feed(1100, 1001)), ctx(&store, 2))
            .run_once()
            .await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.record_count, 30);
        let ids = stored_ids(&store);
        assert_eq!(ids.first().map(String::as_str), Some("1100"));
        assert_eq!(ids.last().map(String::as_str), Some("1071"));
    }

    #[tokio::test]
    async fn later_run_stops_at_newest_stored_event() {
        let store = Arc::new(MemoryStore::new());
        Driver::new(EventLogFetcher::new(cfg(500), feed(1040, 1001)), ctx(&store, 2))
            .run_once()
            .await;

        let driver = Driver::new(EventLogFetcher::new(cfg(500), feed(1063, 1001)), ctx(&store, 9));
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
        assert_eq!(report.record_count, 23);
        // Stopped on the page holding event 1040.
        assert_eq!(driver.fetcher().source.calls(), vec![0, 10, 20]);
        assert_eq!(stored_ids(&store).len(), 63);
    }

    #[tokio::test]
    async fn nothing_new_is_still_a_success() {
        let store = Arc::new(MemoryStore::new());
        Driver::new(EventLogFetcher::new(cfg(500), feed(1010, 1001)), ctx(&store, 2))
            .run_once()
            .await;
        let report = Driver::new(EventLogFetcher::new(cfg(500), feed(1010, 1001)), ctx(&store, 9))
            .run_once()
            .await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.record_count, 0);
        assert_eq!(stored_ids(&store).len(), 10);
    }

    #[tokio::test]
    async fn missing_marker_does_not_duplicate_events() {
        let store = Arc::new(MemoryStore::new());
        Driver::new(EventLogFetcher::new(cfg(500), feed(1020, 1001)), ctx(&store, 2))
            .run_once()
            .await;

        // Event 1020 disappeared upstream; the rest of the old tail is filtered.
        let mut rows: Vec<JsonRow> = (1001..=1030)
            .rev()
            .filter(|id| *id != 1020)
            .enumerate()
            .map(|(i, id)| JsonRow {
                rank: i as u64 + 1,
                id: id.to_string(),
                data: json!({}),
            })
            .collect();
        rows.truncate(25);
        let report = Driver::new(
            EventLogFetcher::new(cfg(500), MemorySource::new(rows, 10)),
            ctx(&store, 9),
        )
        .run_once()
        .await;
        assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
        assert_eq!(report.record_count, 10);
        assert_eq!(stored_ids(&store).len(), 30);
    }
}
