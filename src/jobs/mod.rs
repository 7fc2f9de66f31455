//! Concrete collectors built on the pipeline.
//!
//! The set of jobs is a static table: each slot owns an env prefix and is
//! registered only when `<PREFIX>_URL` is set.

pub mod event_log;
pub mod list_size;
pub mod ranking;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{JobConfig, JobDefaults};
use crate::pipeline::{Job, PipelineContext, Registry};
use crate::util::env::env_opt;

pub type JobFactory = fn(JobConfig, &PipelineContext) -> Arc<dyn Job>;

pub struct JobSlot {
    pub prefix: &'static str,
    pub defaults: JobDefaults,
    pub build: JobFactory,
}

pub const JOB_SLOTS: &[JobSlot] = &[
    JobSlot {
        prefix: "RANKING",
        defaults: ranking::DEFAULTS,
        build: ranking::build,
    },
    JobSlot {
        prefix: "EVENT_LOG",
        defaults: event_log::DEFAULTS,
        build: event_log::build,
    },
    JobSlot {
        prefix: "LIST_SIZE",
        defaults: list_size::DEFAULTS,
        build: list_size::build,
    },
];

pub fn build_registry(ctx: &PipelineContext) -> Result<Registry> {
    build_registry_with(ctx, &env_opt)
}

pub fn build_registry_with(
    ctx: &PipelineContext,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Registry> {
    let mut jobs = Vec::new();
    for slot in JOB_SLOTS {
        let cfg = JobConfig::from_lookup(slot.prefix, slot.defaults, lookup)
            .with_context(|| format!("configuring {} job", slot.prefix))?;
        match cfg {
            Some(cfg) => {
                info!(
                    target = "registry",
                    prefix = slot.prefix,
                    job = %cfg.name,
                    cron = %cfg.cron,
                    "job configured"
                );
                jobs.push((slot.build)(cfg, ctx));
            }
            None => debug!(target = "registry", prefix = slot.prefix, "no URL; job not registered"),
        }
    }
    Registry::new(jobs).context("building job registry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn registers_only_configured_slots() {
        let ctx = PipelineContext::new(Arc::new(MemoryStore::new()));
        let registry = build_registry_with(
            &ctx,
            &lookup_from(&[
                ("RANKING_URL", "https://api.example.invalid/ranking"),
                ("RANKING_NAME", "assets_ranking"),
                ("LIST_SIZE_URL", "https://api.example.invalid/users"),
            ]),
        )
        .unwrap();
        let names: Vec<_> = registry.jobs().iter().map(|j| j.name().to_string()).collect();
        assert_eq!(names, vec!["assets_ranking", "list_size"]);
        assert_eq!(registry.get("list_size").unwrap().cron(), list_size::DEFAULTS.cron);
        assert!(registry.get("event_log").is_none());
    }

    #[test]
    fn clashing_names_and_bad_cron_are_rejected() {
        let ctx = PipelineContext::new(Arc::new(MemoryStore::new()));
        let clash = lookup_from(&[
            ("RANKING_URL", "https://a.invalid"),
            ("RANKING_NAME", "same"),
            ("EVENT_LOG_URL", "https://b.invalid"),
            ("EVENT_LOG_NAME", "same"),
        ]);
        assert!(build_registry_with(&ctx, &clash).is_err());

        let bad_cron = lookup_from(&[("EVENT_LOG_URL", "https://b.invalid"), ("EVENT_LOG_CRON", "hourly")]);
        assert!(build_registry_with(&ctx, &bad_cron).is_err());
    }

    #[test]
    fn default_crons_are_valid() {
        for slot in JOB_SLOTS {
            crate::pipeline::registry::validate_cron(slot.defaults.cron).unwrap();
        }
    }
}
