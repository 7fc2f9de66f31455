//! Typed configuration loaded from the environment.
//!
//! Everything is read through a lookup function so the parsing rules can be
//! exercised without touching the process environment; `from_env` plugs in
//! [`env_opt`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::notify::{NoticePolicy, Notifier, TracingNotifier, WebhookNotifier};
use crate::pipeline::probe::ProbeConfig;
use crate::pipeline::{ExecutionMode, PipelineContext, RetryPolicy};
use crate::sources::http::HttpSourceConfig;
use crate::store::Store;
use crate::util::env::env_opt;

fn parse_or<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn parse_opt<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}"))
        })
        .transpose()
}

/// `name=/json/pointer` pairs separated by commas.
fn parse_field_map(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, path) = pair
                .split_once('=')
                .with_context(|| format!("field mapping {pair:?} is not name=path"))?;
            Ok((name.trim().to_string(), path.trim().to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub db_max_connections: u32,
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_factor: u32,
    pub notify_webhook_url: Option<String>,
    pub notice_policy: NoticePolicy,
    pub mode: ExecutionMode,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_opt)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let notice_policy = match lookup("NOTICE_POLICY") {
            Some(raw) => raw.parse::<NoticePolicy>()?,
            None => NoticePolicy::default(),
        };
        let capacity = parse_or(lookup, "PIPELINE_QUEUE_CAPACITY", 1000usize)?;
        let mode = match lookup("PIPELINE_MODE").as_deref().map(str::trim) {
            None | Some("sequential") => ExecutionMode::Sequential,
            Some("queued") => ExecutionMode::Queued { capacity },
            Some(other) => anyhow::bail!("PIPELINE_MODE={other:?}: expected sequential or queued"),
        };
        Ok(Self {
            db_max_connections: parse_or(lookup, "DB_MAX_CONNECTIONS", 5)?,
            retry_max_attempts: parse_or(lookup, "RETRY_MAX_ATTEMPTS", 5)?,
            retry_base: Duration::from_millis(parse_or(lookup, "RETRY_BASE_MS", 2000)?),
            retry_factor: parse_or(lookup, "RETRY_FACTOR", 2)?,
            notify_webhook_url: lookup("NOTIFY_WEBHOOK_URL"),
            notice_policy,
            mode,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_base, self.retry_factor)
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        match &self.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(TracingNotifier),
        }
    }

    pub fn context(&self, store: Arc<dyn Store>) -> PipelineContext {
        PipelineContext::new(store)
            .with_retry(self.retry_policy())
            .with_notifier(self.notifier(), self.notice_policy)
            .with_mode(self.mode)
    }
}

/// Embedded entity extraction for ranking rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFields {
    pub kind: String,
    pub key_field: String,
    pub id_field: Option<String>,
    pub attrs: Vec<(String, String)>,
}

/// Per-entity detail endpoint used to enrich embedded entities.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailFields {
    /// URL with a `{key}` placeholder.
    pub url: String,
    pub attrs: Vec<(String, String)>,
}

/// Compile-time defaults for one job slot.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub name: &'static str,
    pub cron: &'static str,
    pub page_size: usize,
    pub bulk_size: usize,
    pub timeout_secs: u64,
    pub max_records: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub prefix: String,
    pub name: String,
    pub collection: String,
    /// Batch kind; defaults to the job name.
    pub kind: String,
    pub cron: String,
    pub bulk_size: usize,
    pub timeout: Duration,
    pub expected_total: Option<u64>,
    pub max_records: Option<usize>,
    pub source: HttpSourceConfig,
    pub entity: Option<EntityFields>,
    pub detail: Option<DetailFields>,
    pub probe: ProbeConfig,
}

impl JobConfig {
    /// `Ok(None)` when `<PREFIX>_URL` is unset: the job is not configured.
    pub fn from_env(prefix: &str, defaults: JobDefaults) -> Result<Option<Self>> {
        Self::from_lookup(prefix, defaults, &env_opt)
    }

    pub fn from_lookup(
        prefix: &str,
        defaults: JobDefaults,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>> {
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let get = |suffix: &str| lookup(&key(suffix));

        let Some(url) = get("URL") else {
            return Ok(None);
        };
        let name = get("NAME").unwrap_or_else(|| defaults.name.to_string());
        let page_size = parse_or(lookup, &key("PAGE_SIZE"), defaults.page_size)?;
        if page_size == 0 {
            anyhow::bail!("{} must be positive", key("PAGE_SIZE"));
        }

        let mut source = HttpSourceConfig::new(url, page_size);
        source.timeout = Duration::from_secs(parse_or(lookup, &key("HTTP_TIMEOUT_SECS"), 20)?);
        if let Some(v) = get("OFFSET_PARAM") {
            source.offset_param = v;
        }
        if let Some(v) = get("LIMIT_PARAM") {
            source.limit_param = v;
        }
        if let Some(v) = get("ID_FIELD") {
            source.id_field = v;
        }
        source.items_pointer = get("ITEMS_POINTER");
        source.rank_field = get("RANK_FIELD");
        if let Some(raw) = get("QUERY") {
            source.extra_query = parse_field_map(&raw)
                .with_context(|| format!("parsing {}", key("QUERY")))?;
        }

        let entity = match (get("ENTITY_KIND"), get("ENTITY_KEY_FIELD")) {
            (Some(kind), Some(key_field)) => Some(EntityFields {
                kind,
                key_field,
                id_field: get("ENTITY_ID_FIELD"),
                attrs: parse_field_map(&get("ENTITY_ATTRS").unwrap_or_default())
                    .with_context(|| format!("parsing {}", key("ENTITY_ATTRS")))?,
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "{} and {} must be set together",
                key("ENTITY_KIND"),
                key("ENTITY_KEY_FIELD")
            ),
        };
        let detail = match get("DETAIL_URL") {
            Some(url) => Some(DetailFields {
                url,
                attrs: parse_field_map(&get("DETAIL_ATTRS").unwrap_or_default())
                    .with_context(|| format!("parsing {}", key("DETAIL_ATTRS")))?,
            }),
            None => None,
        };

        let probe_defaults = ProbeConfig::default();
        let probe = ProbeConfig {
            initial_offset: parse_or(lookup, &key("PROBE_OFFSET"), probe_defaults.initial_offset)?,
            initial_step: parse_or(lookup, &key("PROBE_STEP"), probe_defaults.initial_step)?,
            page_size,
            max_tries: parse_or(lookup, &key("PROBE_MAX_TRIES"), probe_defaults.max_tries)?,
        };

        Ok(Some(Self {
            prefix: prefix.to_string(),
            kind: get("KIND").unwrap_or_else(|| name.clone()),
            name,
            collection: get("COLLECTION").unwrap_or_else(|| "collected_records".into()),
            cron: get("CRON").unwrap_or_else(|| defaults.cron.to_string()),
            bulk_size: parse_or(lookup, &key("BULK_SIZE"), defaults.bulk_size)?,
            timeout: Duration::from_secs(parse_or(lookup, &key("TIMEOUT_SECS"), defaults.timeout_secs)?),
            expected_total: parse_opt(lookup, &key("EXPECTED_TOTAL"))?,
            max_records: parse_opt(lookup, &key("MAX_RECORDS"))?.or(defaults.max_records),
            source,
            entity,
            detail,
            probe,
        }))
    }
}
