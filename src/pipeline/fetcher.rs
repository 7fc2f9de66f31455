//! Fetcher lifecycle and the driver that runs it.
//!
//! A [`Fetcher`] describes one collector: where records come from, how they
//! map to stored rows and which batch they belong to. The [`Driver`] owns the
//! run: checkpoint, iterate, transform, reconcile, persist, finalize, report.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::checkpoint::{CheckpointController, Precheck};
use crate::pipeline::clock::{Clock, SystemClock};
use crate::pipeline::error::PipelineError;
use crate::pipeline::guard::RunGuard;
use crate::pipeline::model::{BatchKey, EntityUpdate, PartitionKey, PersistedRecord};
use crate::pipeline::notify::{NoticePolicy, Notifier, TracingNotifier};
use crate::pipeline::queue;
use crate::pipeline::reconcile::Reconciler;
use crate::pipeline::report::{RunOutcome, RunReport, RunState};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::saver::{RecordSink, Saver};
use crate::pipeline::source::{ItemSource, Paginator, SourceRecord};
use crate::store::{RecordQuery, Store};

/// Side effect on a reconciled entity embedded in a record.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityAction {
    Upsert(EntityUpdate),
    /// Upstream reports the entity gone; flag it without touching attributes.
    MarkInaccessible { kind: String, key: String },
}

/// Output of [`Fetcher::transform`] for one source record.
#[derive(Debug, Default)]
pub struct Transformed {
    pub record: Option<PersistedRecord>,
    pub entities: Vec<EntityAction>,
}

impl Transformed {
    pub fn record(record: PersistedRecord) -> Self {
        Self {
            record: Some(record),
            entities: Vec::new(),
        }
    }

    /// Nothing to persist for this item.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, action: EntityAction) -> Self {
        self.entities.push(action);
        self
    }
}

/// Per-run values handed to fetcher hooks.
pub struct RunScope {
    pub batch: BatchKey,
    pub fetched_at: DateTime<Utc>,
    /// Shared with the paginator; its counter feeds the run report.
    pub retry: RetryPolicy,
    store: Arc<dyn Store>,
}

impl RunScope {
    pub fn new(
        batch: BatchKey,
        fetched_at: DateTime<Utc>,
        retry: RetryPolicy,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            batch,
            fetched_at,
            retry,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn checkpoint(&self) -> CheckpointController {
        CheckpointController::new(self.store.clone())
    }

    pub async fn committed(&self, collection: &str) -> Result<u64, PipelineError> {
        self.checkpoint().committed(collection, &self.batch).await
    }
}

pub type ItemOf<F> = <<F as Fetcher>::Source as ItemSource>::Item;

#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    type Source: ItemSource;

    fn name(&self) -> &str;

    /// Store collection the records go to.
    fn collection(&self) -> &str;

    /// Five or six field cron expression; metadata for the trigger.
    fn cron(&self) -> &str;

    fn bulk_size(&self) -> usize {
        100
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn batch_key(&self, now: DateTime<Utc>) -> BatchKey;

    /// Known batch size, e.g. a top-100 listing.
    fn expected_total(&self) -> Option<u64> {
        None
    }

    /// Per-run cap on yielded records.
    fn max_records(&self) -> Option<usize> {
        None
    }

    /// Whether the source can restart at an arbitrary offset.
    fn supports_resume(&self) -> bool {
        false
    }

    fn source(&self) -> Arc<Self::Source>;

    /// Partition an item will be stored under, when known before
    /// `transform`. Resumed runs use it to drop already committed items
    /// without transforming them.
    fn committed_partition(&self, item: &<Self::Source as ItemSource>::Item) -> Option<PartitionKey> {
        item.rank().map(PartitionKey::Rank)
    }

    async fn should_fetch(&self, scope: &RunScope) -> Result<Precheck, PipelineError> {
        scope
            .checkpoint()
            .precheck(
                self.collection(),
                &scope.batch,
                self.expected_total(),
                self.supports_resume(),
            )
            .await
    }

    /// Record id at which a newest-first source should stop.
    async fn stop_marker(&self, _scope: &RunScope) -> Result<Option<String>, PipelineError> {
        Ok(None)
    }

    fn should_stop(&self, item: &<Self::Source as ItemSource>::Item, marker: Option<&str>) -> bool {
        marker.is_some_and(|m| item.record_id() == m)
    }

    async fn should_save(
        &self,
        _item: &<Self::Source as ItemSource>::Item,
        _scope: &RunScope,
    ) -> Result<bool, PipelineError> {
        Ok(true)
    }

    async fn transform(
        &self,
        item: <Self::Source as ItemSource>::Item,
        scope: &RunScope,
    ) -> Result<Transformed, PipelineError>;

    /// Default: the batch now has data.
    async fn is_success(&self, scope: &RunScope, _saved: usize) -> Result<bool, PipelineError> {
        Ok(scope.committed(self.collection()).await? > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Fetch, transform and flush interleaved on one task.
    #[default]
    Sequential,
    /// Transform on the run task, persist on a spawned consumer.
    Queued { capacity: usize },
}

/// Shared collaborators every driver needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn Store>,
    pub retry: RetryPolicy,
    pub notifier: Arc<dyn Notifier>,
    pub notice_policy: NoticePolicy,
    pub mode: ExecutionMode,
    pub guard: RunGuard,
    pub clock: Arc<dyn Clock>,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            notifier: Arc::new(TracingNotifier),
            notice_policy: NoticePolicy::default(),
            mode: ExecutionMode::default(),
            guard: RunGuard::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, policy: NoticePolicy) -> Self {
        self.notifier = notifier;
        self.notice_policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Registry-facing view of a driver.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    fn collection(&self) -> &str;
    fn cron(&self) -> &str;
    async fn run(&self) -> RunReport;
}

#[derive(Debug, Default)]
struct Progress {
    seen: usize,
    item_errors: usize,
    already_committed: usize,
}

/// Where the walk starts and whether earlier runs left records behind.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    offset: u64,
    resumed: bool,
}

struct Conclusion {
    outcome: RunOutcome,
    saved: usize,
    item_errors: usize,
    message: Option<String>,
}

impl Conclusion {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::Skipped,
            saved: 0,
            item_errors: 0,
            message: Some(message.into()),
        }
    }

    fn failed(err: &PipelineError, saved: usize, item_errors: usize) -> Self {
        Self {
            outcome: RunOutcome::Failed,
            saved,
            item_errors,
            message: Some(format!("{err} ({saved} records saved)")),
        }
    }
}

pub struct Driver<F: Fetcher> {
    fetcher: F,
    ctx: PipelineContext,
}

impl<F: Fetcher> Driver<F> {
    pub fn new(fetcher: F, ctx: PipelineContext) -> Self {
        Self { fetcher, ctx }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// One scheduled run. Never panics on pipeline errors; the outcome is
    /// carried in the report.
    pub async fn run_once(&self) -> RunReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let fetched_at = self.ctx.clock.now();
        let batch = self.fetcher.batch_key(fetched_at);
        let scope = RunScope::new(
            batch.clone(),
            fetched_at,
            self.ctx.retry.fresh(),
            self.ctx.store.clone(),
        );
        let span = info_span!("run", fetcher = self.fetcher.name(), batch = %batch, %run_id);

        let conclusion = async {
            match self.ctx.guard.try_acquire(self.fetcher.collection(), &batch) {
                None => {
                    warn!("another run holds this batch key");
                    Conclusion::skipped("already running")
                }
                Some(_lease) => {
                    self.execute(&scope, started + self.fetcher.timeout())
                        .await
                }
            }
        }
        .instrument(span.clone())
        .await;

        let report = RunReport {
            run_id,
            fetcher: self.fetcher.name().to_string(),
            collection: self.fetcher.collection().to_string(),
            batch,
            outcome: conclusion.outcome,
            record_count: conclusion.saved,
            item_errors: conclusion.item_errors,
            duration_ms: started.elapsed().as_millis() as u64,
            retries: scope.retry.retries(),
            message: conclusion.message,
        };
        span.in_scope(|| match report.outcome {
            RunOutcome::Succeeded => info!(
                record_count = report.record_count,
                item_errors = report.item_errors,
                duration_ms = report.duration_ms,
                "run succeeded"
            ),
            RunOutcome::Skipped => info!(message = ?report.message, "run skipped"),
            RunOutcome::Failed => error!(
                record_count = report.record_count,
                retries = report.retries,
                message = ?report.message,
                "run failed"
            ),
        });
        self.notify(&report).await;
        report
    }

    fn transition(&self, state: &mut RunState, next: RunState) {
        debug!(fetcher = self.fetcher.name(), from = ?*state, to = ?next, "state transition");
        *state = next;
    }

    async fn execute(&self, scope: &RunScope, deadline: Instant) -> Conclusion {
        let mut state = RunState::Init;
        self.transition(&mut state, RunState::Checking);

        let precheck = match timeout_at(deadline, self.fetcher.should_fetch(scope)).await {
            Ok(Ok(precheck)) => precheck,
            Ok(Err(e)) => return Conclusion::failed(&e, 0, 0),
            Err(_) => return Conclusion::failed(&PipelineError::Timeout(self.fetcher.timeout()), 0, 0),
        };
        let cursor = match precheck {
            Precheck::Skip { committed } => {
                self.transition(&mut state, RunState::Skipped);
                return Conclusion::skipped(format!("batch already has {committed} records"));
            }
            Precheck::Start => Cursor {
                offset: 0,
                resumed: false,
            },
            Precheck::Resume { offset, .. } if self.fetcher.supports_resume() => Cursor {
                offset,
                resumed: true,
            },
            Precheck::Resume { committed, .. } => {
                self.transition(&mut state, RunState::Failed);
                let err = PipelineError::ResumeUnsupported {
                    fetcher: self.fetcher.name().to_string(),
                    batch: scope.batch.clone(),
                    committed,
                };
                return Conclusion::failed(&err, 0, 0);
            }
        };

        let prepared = async {
            let marker = self.fetcher.stop_marker(scope).await?;
            let saver = Saver::new(
                scope.store().clone(),
                self.fetcher.collection(),
                self.fetcher.bulk_size(),
            )?;
            Ok::<_, PipelineError>((marker, saver))
        }
        .await;
        let (marker, saver) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.transition(&mut state, RunState::Failed);
                return Conclusion::failed(&e, 0, 0);
            }
        };
        if let Some(marker) = &marker {
            info!(stop_at = %marker, "newest stored record found");
        }

        self.transition(&mut state, RunState::Fetching);
        let conclusion = match self.ctx.mode {
            ExecutionMode::Sequential => {
                self.fetch_sequential(scope, cursor, marker.as_deref(), saver, deadline)
                    .await
            }
            ExecutionMode::Queued { capacity } => {
                self.fetch_queued(scope, cursor, marker.as_deref(), saver, capacity, deadline)
                    .await
            }
        };
        self.transition(&mut state, conclusion.outcome.into());
        conclusion
    }

    async fn fetch_sequential(
        &self,
        scope: &RunScope,
        cursor: Cursor,
        marker: Option<&str>,
        mut saver: Saver,
        deadline: Instant,
    ) -> Conclusion {
        let mut progress = Progress::default();
        let produced = timeout_at(
            deadline,
            self.produce(scope, cursor, marker, &mut saver, &mut progress),
        )
        .await;
        let result = produced.unwrap_or(Err(PipelineError::Timeout(self.fetcher.timeout())));
        self.conclude(scope, result, saver, progress).await
    }

    async fn fetch_queued(
        &self,
        scope: &RunScope,
        cursor: Cursor,
        marker: Option<&str>,
        saver: Saver,
        capacity: usize,
        deadline: Instant,
    ) -> Conclusion {
        let flushed = saver.flushed_counter();
        let (mut sink, consumer) = queue::spawn_consumer(saver, capacity, self.fetcher.bulk_size());
        let mut progress = Progress::default();
        let produced = timeout_at(
            deadline,
            self.produce(scope, cursor, marker, &mut sink, &mut progress),
        )
        .await;
        let mut result = produced.unwrap_or(Err(PipelineError::Timeout(self.fetcher.timeout())));
        if result.is_ok() {
            sink.finish().await;
        } else {
            drop(sink);
        }

        let outcome = match consumer.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let err = PipelineError::Worker(join_err.to_string());
                return Conclusion::failed(&err, flushed.load(Ordering::Relaxed), progress.item_errors);
            }
        };
        // The consumer's error is the root cause of a producer send failure.
        if let Some(err) = outcome.error {
            result = Err(err);
        }
        self.conclude(scope, result, outcome.saver, progress).await
    }

    /// Final flush and success check, or flush-then-fail.
    async fn conclude(
        &self,
        scope: &RunScope,
        result: Result<(), PipelineError>,
        mut saver: Saver,
        progress: Progress,
    ) -> Conclusion {
        let item_errors = progress.item_errors;
        let err = match result {
            Ok(()) => match saver.finalize().await {
                Ok(_) => match self.fetcher.is_success(scope, saver.flushed_count()).await {
                    Ok(true) => {
                        return Conclusion {
                            outcome: RunOutcome::Succeeded,
                            saved: saver.flushed_count(),
                            item_errors,
                            message: None,
                        }
                    }
                    Ok(false) => {
                        warn!(seen = progress.seen, "success check found no data");
                        PipelineError::EmptyBatch(scope.batch.clone())
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            },
            Err(e) => {
                if !e.is_store_failure() {
                    match saver.finalize().await {
                        Ok(0) => {}
                        Ok(flushed) => warn!(flushed, error = %e, "flushed partial progress before failing"),
                        Err(flush_err) => {
                            error!(error = %flush_err, "could not flush partial progress")
                        }
                    }
                }
                e
            }
        };
        Conclusion::failed(&err, saver.flushed_count(), item_errors)
    }

    async fn produce(
        &self,
        scope: &RunScope,
        cursor: Cursor,
        marker: Option<&str>,
        sink: &mut dyn RecordSink,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        let reconciler = Reconciler::new(scope.store().clone());
        let mut pager = Paginator::new(
            self.fetcher.source(),
            cursor.offset,
            self.fetcher.max_records(),
            scope.retry.clone(),
        );
        while let Some(item) = pager.next_item().await? {
            if self.fetcher.should_stop(&item, marker) {
                info!(item = %item.record_id(), "reached newest stored record; stopping");
                return Ok(());
            }
            progress.seen += 1;
            // Resumed runs may walk over records an earlier run stored.
            let check_record = match (cursor.resumed, self.fetcher.committed_partition(&item)) {
                (false, _) => false,
                (true, Some(partition)) => {
                    if self.is_committed(scope, partition).await? {
                        progress.already_committed += 1;
                        continue;
                    }
                    false
                }
                (true, None) => true,
            };
            let id = item.record_id();
            let rank = item.rank();
            match self.process_item(scope, &reconciler, item, check_record, sink).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() || e.is_rate_limit() => {
                    error!(item = %id, rank = ?rank, error = %e, "aborting run");
                    return Err(e);
                }
                Err(e) => {
                    progress.item_errors += 1;
                    warn!(item = %id, rank = ?rank, error = %e, "item failed; continuing");
                }
            }
        }
        if let Some(max) = self.fetcher.max_records() {
            if pager.yielded() >= max {
                warn!(max, "per-run record cap reached");
            }
        }
        if progress.already_committed > 0 {
            info!(already_committed = progress.already_committed, "skipped records stored by earlier runs");
        }
        debug!(pages = pager.pages_fetched(), items = progress.seen, "source exhausted");
        Ok(())
    }

    async fn process_item(
        &self,
        scope: &RunScope,
        reconciler: &Reconciler,
        item: ItemOf<F>,
        check_record: bool,
        sink: &mut dyn RecordSink,
    ) -> Result<(), PipelineError> {
        if !self.fetcher.should_save(&item, scope).await? {
            debug!(item = %item.record_id(), "filtered out");
            return Ok(());
        }
        let transformed = self.fetcher.transform(item, scope).await?;
        if check_record {
            if let Some(record) = &transformed.record {
                if self.is_committed(scope, record.partition.clone()).await? {
                    debug!(partition = %record.partition, "already committed");
                    return Ok(());
                }
            }
        }
        for action in &transformed.entities {
            match action {
                EntityAction::Upsert(update) => {
                    reconciler.upsert(update).await?;
                }
                EntityAction::MarkInaccessible { kind, key } => {
                    reconciler.mark_inaccessible(kind, key).await?;
                }
            }
        }
        if let Some(record) = transformed.record {
            sink.accept(record).await?;
        }
        Ok(())
    }

    async fn is_committed(&self, scope: &RunScope, partition: PartitionKey) -> Result<bool, PipelineError> {
        let query = RecordQuery::for_partition(&scope.batch, partition);
        Ok(scope
            .store()
            .find_one(self.fetcher.collection(), &query)
            .await?
            .is_some())
    }

    async fn notify(&self, report: &RunReport) {
        if !self.ctx.notice_policy.should_notify(report.outcome) {
            return;
        }
        if let Err(e) = self.ctx.notifier.notify(report).await {
            warn!(fetcher = %report.fetcher, error = %e, "notification failed");
        }
    }
}

#[async_trait]
impl<F: Fetcher> Job for Driver<F> {
    fn name(&self) -> &str {
        self.fetcher.name()
    }

    fn collection(&self) -> &str {
        self.fetcher.collection()
    }

    fn cron(&self) -> &str {
        self.fetcher.cron()
    }

    async fn run(&self) -> RunReport {
        self.run_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{Entity, EntityPatch, PartitionKey};
    use crate::store::{EntityStore, MemoryStore, RecordStore};
    use crate::sources::memory::{MemorySource, RankedItem};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn key() -> BatchKey {
        BatchKey::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), "assets_ranking")
    }

    struct RankFetcher {
        source: Arc<MemorySource<RankedItem>>,
        expected: Option<u64>,
        bulk: usize,
        resume: bool,
        fail_rank: Option<u64>,
        collide_from: Option<u64>,
        delay: Option<Duration>,
        timeout: Duration,
        users: bool,
        keyed_after_transform: bool,
    }

    impl RankFetcher {
        fn new(source: MemorySource<RankedItem>, expected: u64) -> Self {
            Self {
                source: Arc::new(source),
                expected: Some(expected),
                bulk: 20,
                resume: true,
                fail_rank: None,
                collide_from: None,
                delay: None,
                timeout: Duration::from_secs(30),
                users: false,
                keyed_after_transform: false,
            }
        }
    }

    #[async_trait]
    impl Fetcher for RankFetcher {
        type Source = MemorySource<RankedItem>;

        fn name(&self) -> &str {
            "assets_ranking"
        }
        fn collection(&self) -> &str {
            "records"
        }
        fn cron(&self) -> &str {
            "0 0 * * *"
        }
        fn bulk_size(&self) -> usize {
            self.bulk
        }
        fn timeout(&self) -> Duration {
            self.timeout
        }
        fn batch_key(&self, _now: DateTime<Utc>) -> BatchKey {
            key()
        }
        fn expected_total(&self) -> Option<u64> {
            self.expected
        }
        fn supports_resume(&self) -> bool {
            self.resume
        }
        fn source(&self) -> Arc<Self::Source> {
            self.source.clone()
        }
        fn committed_partition(&self, item: &RankedItem) -> Option<PartitionKey> {
            (!self.keyed_after_transform).then_some(PartitionKey::Rank(item.rank))
        }

        async fn transform(
            &self,
            item: RankedItem,
            scope: &RunScope,
        ) -> Result<Transformed, PipelineError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_rank == Some(item.rank) {
                return Err(PipelineError::item(item.id.clone(), anyhow::anyhow!("bad row")));
            }
            let partition = match self.collide_from {
                Some(from) if item.rank >= from => PartitionKey::Rank(from),
                _ => PartitionKey::Rank(item.rank),
            };
            let record = PersistedRecord::from_value(scope.batch.clone(), partition, &item)
                .map_err(|e| PipelineError::item(item.id.clone(), e))?;
            let mut out = Transformed::record(record);
            if self.users {
                out = out.with_entity(EntityAction::Upsert(
                    EntityUpdate::new("user", format!("u{}", item.rank % 3), scope.fetched_at)
                        .with_attr("name", Some(format!("name-{}", item.rank))),
                ));
            }
            Ok(out)
        }
    }

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<Vec<RunReport>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, report: &RunReport) -> anyhow::Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    fn ctx(store: &Arc<MemoryStore>) -> PipelineContext {
        PipelineContext::new(store.clone()).with_retry(RetryPolicy::none())
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

    #[tokio::test]
    async fn fresh_run_commits_every_record() {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::new(RankFetcher::new(MemorySource::ranked(45, 10), 45), ctx(&store));
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
        assert_eq!(report.record_count, 45);
        assert_eq!(store.insert_batches(), vec![20, 20, 5]);
    }

    #[tokio::test]
    async fn completed_batch_is_skipped_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::new(RankFetcher::new(MemorySource::ranked(45, 10), 45), ctx(&store));
        driver.run_once().await;
        let writes = store.write_count();
        let calls = driver.fetcher().source.calls().len();

        let second = driver.run_once().await;
        assert_eq!(second.outcome, RunOutcome::Skipped);
        assert_eq!(store.write_count(), writes);
        assert_eq!(driver.fetcher().source.calls().len(), calls);
    }

    #[tokio::test]
    async fn partial_batch_resumes_after_committed_ranks() {
        let store = Arc::new(MemoryStore::new());
        precommit(&store, 1..=12).await;
        let driver = Driver::new(RankFetcher::new(MemorySource::ranked(45, 10), 45), ctx(&store));
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.record_count, 33);
        assert_eq!(driver.fetcher().source.calls()[0], 12);
        assert_eq!(store.count_by_key("records", &key()).await.unwrap(), 45);
    }

    fn stored_ranks(store: &MemoryStore) -> Vec<u64> {
        let mut ranks: Vec<_> = store
            .records("records")
            .iter()
            .filter_map(|r| r.partition.ordinal())
            .collect();
        ranks.sort_unstable();
        ranks
    }

    #[tokio::test]
    async fn rank_lost_to_an_item_error_is_collected_next_run() {
        for keyed_after_transform in [false, true] {
            let store = Arc::new(MemoryStore::new());
            let mut first = RankFetcher::new(MemorySource::ranked(45, 10), 45);
            first.fail_rank = Some(5);
            let report = Driver::new(first, ctx(&store)).run_once().await;
            assert_eq!(report.outcome, RunOutcome::Succeeded);
            assert_eq!(report.record_count, 44);

            let mut second = RankFetcher::new(MemorySource::ranked(45, 10), 45);
            second.keyed_after_transform = keyed_after_transform;
            let driver = Driver::new(second, ctx(&store));
            let report = driver.run_once().await;
            assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
            assert_eq!(report.record_count, 1);
            // The hole sits below the highest rank, so the walk restarts at the top.
            assert_eq!(driver.fetcher().source.calls()[0], 0);
            assert_eq!(stored_ranks(&store), (1..=45).collect::<Vec<_>>());

            let third = driver.run_once().await;
            assert_eq!(third.outcome, RunOutcome::Skipped);
        }
    }

    #[tokio::test]
    async fn open_ended_batch_resumes_after_a_rate_limit() {
        let store = Arc::new(MemoryStore::new());
        let mut first = RankFetcher::new(MemorySource::ranked(100, 10).rate_limited_from(30), 0);
        first.expected = None;
        let report = Driver::new(first, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.record_count, 30);

        let mut second = RankFetcher::new(MemorySource::ranked(100, 10), 0);
        second.expected = None;
        let driver = Driver::new(second, ctx(&store));
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.message);
        assert_eq!(report.record_count, 70);
        assert_eq!(driver.fetcher().source.calls()[0], 30);
        assert_eq!(stored_ranks(&store), (1..=100).collect::<Vec<_>>());

        // Nothing left upstream: the run still succeeds, with no writes.
        let writes = store.write_count();
        let again = driver.run_once().await;
        assert_eq!(again.outcome, RunOutcome::Succeeded);
        assert_eq!(again.record_count, 0);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn resume_without_support_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        precommit(&store, 1..=10).await;
        let mut fetcher = RankFetcher::new(MemorySource::ranked(45, 10), 45);
        fetcher.resume = false;
        let driver = Driver::new(fetcher, ctx(&store));
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(report.message.unwrap().contains("cannot resume"));
        assert!(driver.fetcher().source.calls().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_flushes_partial_progress_then_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(100, 10).rate_limited_from(30), 100);
        fetcher.bulk = 50;
        let report = Driver::new(fetcher, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(report.message.unwrap().contains("rate limited"));
        assert_eq!(report.record_count, 30);
        assert_eq!(store.count_by_key("records", &key()).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn bad_item_is_skipped_and_run_continues() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(45, 10), 45);
        fetcher.fail_rank = Some(5);
        let report = Driver::new(fetcher, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.record_count, 44);
        assert_eq!(report.item_errors, 1);
    }

    #[tokio::test]
    async fn duplicate_partition_key_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(45, 10), 45);
        fetcher.collide_from = Some(11);
        fetcher.bulk = 100;
        let report = Driver::new(fetcher, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(report.message.unwrap().contains("duplicate partition key"));
        // Everything accepted before the conflict is kept.
        assert_eq!(store.count_by_key("records", &key()).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn queued_mode_commits_the_same_records() {
        let sequential = Arc::new(MemoryStore::new());
        let queued = Arc::new(MemoryStore::new());
        Driver::new(RankFetcher::new(MemorySource::ranked(73, 10), 73), ctx(&sequential))
            .run_once()
            .await;
        let report = Driver::new(
            RankFetcher::new(MemorySource::ranked(73, 10), 73),
            ctx(&queued).with_mode(ExecutionMode::Queued { capacity: 8 }),
        )
        .run_once()
        .await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.record_count, 73);
        assert_eq!(queued.records("records"), sequential.records("records"));
    }

    #[tokio::test]
    async fn queued_mode_flushes_before_failing() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(100, 10).rate_limited_from(40), 100);
        fetcher.bulk = 25;
        let report = Driver::new(
            fetcher,
            ctx(&store).with_mode(ExecutionMode::Queued { capacity: 4 }),
        )
        .run_once()
        .await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.record_count, 40);
        assert_eq!(store.count_by_key("records", &key()).await.unwrap(), 40);
    }

    /// Memory store whose `panic_on`-th record insert panics.
    struct CrashingStore {
        inner: MemoryStore,
        panic_on: usize,
        inserts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for CrashingStore {
        async fn insert_many(
            &self,
            collection: &str,
            records: &[PersistedRecord],
        ) -> crate::store::Result<()> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) + 1 == self.panic_on {
                panic!("store crashed");
            }
            self.inner.insert_many(collection, records).await
        }

        async fn count_by_key(&self, collection: &str, key: &BatchKey) -> crate::store::Result<u64> {
            self.inner.count_by_key(collection, key).await
        }

        async fn find_one(
            &self,
            collection: &str,
            query: &RecordQuery,
        ) -> crate::store::Result<Option<PersistedRecord>> {
            self.inner.find_one(collection, query).await
        }
    }

    #[async_trait]
    impl EntityStore for CrashingStore {
        async fn get_entity(&self, kind: &str, key: &str) -> crate::store::Result<Option<Entity>> {
            self.inner.get_entity(kind, key).await
        }

        async fn insert_entity(&self, entity: &Entity) -> crate::store::Result<()> {
            self.inner.insert_entity(entity).await
        }

        async fn update_entity(
            &self,
            kind: &str,
            key: &str,
            patch: &EntityPatch,
        ) -> crate::store::Result<()> {
            self.inner.update_entity(kind, key, patch).await
        }
    }

    #[tokio::test]
    async fn crashed_consumer_still_reports_flushed_records() {
        let store = Arc::new(CrashingStore {
            inner: MemoryStore::new(),
            panic_on: 3,
            inserts: Default::default(),
        });
        let mut fetcher = RankFetcher::new(MemorySource::ranked(45, 10), 45);
        fetcher.bulk = 10;
        let context = PipelineContext::new(store.clone())
            .with_retry(RetryPolicy::none())
            .with_mode(ExecutionMode::Queued { capacity: 4 });
        let report = Driver::new(fetcher, context).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.record_count, 20);
        assert_eq!(store.inner.count_by_key("records", &key()).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn timeout_fails_and_keeps_progress() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(100, 10), 100);
        fetcher.bulk = 1000;
        fetcher.delay = Some(Duration::from_millis(20));
        fetcher.timeout = Duration::from_millis(150);
        let report = Driver::new(fetcher, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(report.message.unwrap().contains("timeout"));
        let committed = store.count_by_key("records", &key()).await.unwrap() as usize;
        assert_eq!(committed, report.record_count);
        assert!(committed > 0 && committed < 100);
    }

    #[tokio::test]
    async fn same_batch_key_in_flight_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let context = ctx(&store);
        let driver = Driver::new(RankFetcher::new(MemorySource::ranked(45, 10), 45), context.clone());
        let _lease = context.guard.try_acquire("records", &key()).unwrap();
        let report = driver.run_once().await;
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(report.message.as_deref(), Some("already running"));
        assert!(driver.fetcher().source.calls().is_empty());
    }

    #[tokio::test]
    async fn only_failed_runs_are_notified() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let context = ctx(&store).with_notifier(recorder.clone(), NoticePolicy::OnlyFailed);

        Driver::new(
            RankFetcher::new(MemorySource::ranked(100, 10).rate_limited_from(20), 100),
            context.clone(),
        )
        .run_once()
        .await;
        Driver::new(RankFetcher::new(MemorySource::ranked(100, 10), 100), context)
            .run_once()
            .await;

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, RunOutcome::Failed);
        assert_eq!(reports[0].batch, key());
    }

    #[tokio::test]
    async fn default_policy_sends_the_success_event() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let context = ctx(&store).with_notifier(recorder.clone(), NoticePolicy::default());
        Driver::new(RankFetcher::new(MemorySource::ranked(45, 10), 45), context)
            .run_once()
            .await;

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, RunOutcome::Succeeded);
        assert_eq!(reports[0].record_count, 45);
    }

    #[tokio::test]
    async fn embedded_entities_are_reconciled() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = RankFetcher::new(MemorySource::ranked(9, 10), 9);
        fetcher.users = true;
        let report = Driver::new(fetcher, ctx(&store)).run_once().await;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        // u0 saw ranks 3, 6, 9 in that order.
        let u0 = store.entity("user", "u0").unwrap();
        assert_eq!(u0.attr("name"), Some("name-9"));
        assert_eq!(u0.history_of("name"), ["name-3", "name-6"].map(String::from));
    }
}
