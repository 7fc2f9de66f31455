use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use incremental_collector::pipeline::clock::FixedClock;
use incremental_collector::pipeline::{
    BatchKey, Driver, Fetcher, PartitionKey, PersistedRecord, PipelineContext, PipelineError,
    RetryPolicy, RunOutcome, RunScope, Transformed,
};
use incremental_collector::sources::memory::{MemorySource, RankedItem};
use incremental_collector::store::{MemoryStore, RecordStore};

const TOTAL: u64 = 1000;

fn key() -> BatchKey {
    BatchKey::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), "assets_ranking")
}

fn fetch_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap()
}

struct AssetsRanking {
    source: Arc<MemorySource<RankedItem>>,
}

#[async_trait]
impl Fetcher for AssetsRanking {
    type Source = MemorySource<RankedItem>;

    fn name(&self) -> &str {
        "assets_ranking"
    }

    fn collection(&self) -> &str {
        "records"
    }

    fn cron(&self) -> &str {
        "0 30 0 * * *"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn batch_key(&self, now: DateTime<Utc>) -> BatchKey {
        BatchKey::new(now.date_naive(), "assets_ranking")
    }

    fn expected_total(&self) -> Option<u64> {
        Some(TOTAL)
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn source(&self) -> Arc<Self::Source> {
        self.source.clone()
    }

    async fn transform(&self, item: RankedItem, scope: &RunScope) -> Result<Transformed, PipelineError> {
        let record = PersistedRecord::from_value(scope.batch.clone(), PartitionKey::Rank(item.rank), &item)?;
        Ok(Transformed::record(record))
    }
}

fn ctx(store: &Arc<MemoryStore>) -> PipelineContext {
    PipelineContext::new(store.clone())
        .with_retry(RetryPolicy::none())
        .with_clock(Arc::new(FixedClock(fetch_time())))
}

fn ranking(source: MemorySource<RankedItem>) -> (Arc<MemorySource<RankedItem>>, AssetsRanking) {
    let source = Arc::new(source);
    (source.clone(), AssetsRanking { source })
}

async fn precommit(store: &MemoryStore, ranks: std::ops::RangeInclusive<u64>) {
    let rows: Vec<_> = ranks
        .map(|rank| {
            let item = RankedItem {
                rank,
                id: format!("item-{rank}"),
                value: rank as i64 * 10,
            };
            PersistedRecord::from_value(key(), PartitionKey::Rank(rank), &item).unwrap()
        })
        .collect();
    store.insert_many("records", &rows).await.unwrap();
}

fn ranks(store: &MemoryStore) -> Vec<u64> {
    store
        .records("records")
        .into_iter()
        .filter_map(|r| r.partition.ordinal())
        .collect()
}

#[tokio::test]
async fn interrupted_batch_resumes_where_it_stopped() {
    let store = Arc::new(MemoryStore::new());
    precommit(&store, 1..=400).await;

    let (source, fetcher) = ranking(MemorySource::ranked(TOTAL, 50));
    let report = Driver::new(fetcher, ctx(&store)).run_once().await;

    assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
    assert_eq!(report.record_count, 600);
    assert_eq!(source.calls().first(), Some(&400));
    assert_eq!(store.count_by_key("records", &key()).await.unwrap(), TOTAL);
    assert_eq!(ranks(&store), (1..=TOTAL).collect::<Vec<_>>());

    // Same content as a run that never stopped.
    let fresh = Arc::new(MemoryStore::new());
    let (_, fetcher) = ranking(MemorySource::ranked(TOTAL, 50));
    Driver::new(fetcher, ctx(&fresh)).run_once().await;
    assert_eq!(fresh.records("records"), store.records("records"));
}

#[tokio::test]
async fn completed_batch_is_left_alone() {
    let store = Arc::new(MemoryStore::new());
    let (source, fetcher) = ranking(MemorySource::ranked(TOTAL, 50));
    let driver = Driver::new(fetcher, ctx(&store));
    assert_eq!(driver.run_once().await.outcome, RunOutcome::Succeeded);

    let writes = store.write_count();
    let calls = source.calls().len();
    let second = driver.run_once().await;

    assert_eq!(second.outcome, RunOutcome::Skipped);
    assert_eq!(second.record_count, 0);
    assert_eq!(store.write_count(), writes);
    assert_eq!(source.calls().len(), calls);
}

#[tokio::test]
async fn rate_limited_run_keeps_progress_and_the_next_run_finishes() {
    let store = Arc::new(MemoryStore::new());
    let (_, fetcher) = ranking(MemorySource::ranked(TOTAL, 50).rate_limited_from(700));
    let report = Driver::new(fetcher, ctx(&store)).run_once().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.record_count, 700);
    assert_eq!(store.count_by_key("records", &key()).await.unwrap(), 700);

    let (source, fetcher) = ranking(MemorySource::ranked(TOTAL, 50));
    let retry = Driver::new(fetcher, ctx(&store)).run_once().await;
    assert_eq!(retry.outcome, RunOutcome::Succeeded);
    assert_eq!(retry.record_count, 300);
    assert_eq!(source.calls().first(), Some(&700));
    assert_eq!(ranks(&store), (1..=TOTAL).collect::<Vec<_>>());
}
