//! Fixed-size ranked listings (e.g. a daily top-1000), resumable by offset.
//!
//! Each row is stored under its rank. When configured, the user embedded in a
//! row is reconciled into the entity store, optionally enriched from a
//! per-user detail endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{JobConfig, JobDefaults};
use crate::pipeline::error::SourceError;
use crate::pipeline::source::ItemSource;
use crate::pipeline::{
    BatchKey, Driver, EntityAction, EntityUpdate, Fetcher, Job, PartitionKey, PersistedRecord,
    PipelineContext, PipelineError, RunScope, Transformed,
};
use crate::sources::http::{lookup, lookup_str, JsonDetailClient, JsonPageSource, JsonRow};
use crate::sources::DetailSource;

pub const DEFAULTS: JobDefaults = JobDefaults {
    name: "ranking",
    cron: "0 30 0 * * *",
    page_size: 20,
    bulk_size: 100,
    timeout_secs: 1800,
    max_records: None,
};

pub fn build(cfg: JobConfig, ctx: &PipelineContext) -> Arc<dyn Job> {
    Arc::new(Driver::new(RankingFetcher::from_config(cfg), ctx.clone()))
}

fn external_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct RankingFetcher<S = JsonPageSource> {
    cfg: JobConfig,
    source: Arc<S>,
    detail: Option<Arc<dyn DetailSource>>,
}

impl RankingFetcher<JsonPageSource> {
    pub fn from_config(cfg: JobConfig) -> Self {
        let source = JsonPageSource::new(cfg.source.clone());
        let detail = cfg.detail.as_ref().map(|d| {
            Arc::new(JsonDetailClient::new(d.url.clone(), cfg.source.timeout)) as Arc<dyn DetailSource>
        });
        Self {
            source: Arc::new(source),
            detail,
            cfg,
        }
    }
}

impl<S> RankingFetcher<S> {
    pub fn new(cfg: JobConfig, source: S) -> Self {
        Self {
            cfg,
            source: Arc::new(source),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Arc<dyn DetailSource>) -> Self {
        self.detail = Some(detail);
        self
    }

    fn entity_update(&self, row: &JsonRow, seen_at: DateTime<Utc>) -> Option<EntityUpdate> {
        let fields = self.cfg.entity.as_ref()?;
        let key = row.str_field(&fields.key_field)?;
        let id = fields
            .id_field
            .as_deref()
            .and_then(|f| row.field(f))
            .and_then(external_id);
        let mut update = EntityUpdate::new(&fields.kind, key, seen_at).with_external_id(id);
        for (name, path) in &fields.attrs {
            update = update.with_attr(name, row.str_field(path));
        }
        Some(update)
    }

    /// Merge detail attributes into `update`. `Ok(None)` means upstream no
    /// longer serves the entity.
    async fn enrich(
        &self,
        mut update: EntityUpdate,
        scope: &RunScope,
    ) -> Result<Option<EntityUpdate>, SourceError> {
        let (Some(detail), Some(fields)) = (&self.detail, &self.cfg.detail) else {
            return Ok(Some(update));
        };
        let detail = &**detail;
        let key = update.key.clone();
        let fetched = scope
            .retry
            .run("enrich", || detail.detail(key.as_str()))
            .await;
        match fetched {
            Ok(body) => {
                for (name, path) in &fields.attrs {
                    update = update.with_attr(name, lookup_str(&body, path));
                }
                if update.external_id.is_none() {
                    update.external_id = lookup(&body, "id").and_then(external_id);
                }
                Ok(Some(update))
            }
            Err(SourceError::Unavailable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: ItemSource<Item = JsonRow>> Fetcher for RankingFetcher<S> {
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

    fn expected_total(&self) -> Option<u64> {
        self.cfg.expected_total
    }

    fn max_records(&self) -> Option<usize> {
        self.cfg.max_records
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn source(&self) -> Arc<S> {
        self.source.clone()
    }

    async fn transform(&self, row: JsonRow, scope: &RunScope) -> Result<Transformed, PipelineError> {
        let update = self.entity_update(&row, scope.fetched_at);
        let payload = json!({
            "rank": row.rank,
            "id": row.id,
            "fetched_at": scope.fetched_at.to_rfc3339(),
            "data": row.data,
        });
        let mut out = Transformed::record(PersistedRecord::new(
            scope.batch.clone(),
            PartitionKey::Rank(row.rank),
            payload,
        ));

        let Some(update) = update else {
            return Ok(out);
        };
        let (kind, key) = (update.kind.clone(), update.key.clone());
        match self.enrich(update, scope).await {
            Ok(Some(update)) => out = out.with_entity(EntityAction::Upsert(update)),
            Ok(None) => {
                warn!(rank = row.rank, kind = %kind, key = %key, "entity unavailable upstream");
                out = out.with_entity(EntityAction::MarkInaccessible { kind, key });
            }
            Err(e) if e.is_rate_limit() => return Err(e.into()),
            Err(e) => return Err(PipelineError::item(format!("rank {}", row.rank), e)),
        }
        Ok(out)
    }
}
