//! Explicit, statically built list of jobs. Nothing registers itself.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::pipeline::error::PipelineError;
use crate::pipeline::fetcher::Job;
use crate::pipeline::report::RunReport;

/// Shape check for five or six field cron expressions. Evaluation belongs to
/// the external trigger.
pub fn validate_cron(expr: &str) -> Result<(), PipelineError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if !(5..=6).contains(&fields.len()) {
        return Err(PipelineError::Config(format!(
            "cron {expr:?} has {} fields, expected 5 or 6",
            fields.len()
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "*,-/?#".contains(c);
    if let Some(bad) = fields.iter().find(|f| !f.chars().all(allowed)) {
        return Err(PipelineError::Config(format!(
            "cron {expr:?}: invalid field {bad:?}"
        )));
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct Registry {
    jobs: Vec<Arc<dyn Job>>,
}

impl Registry {
    pub fn new(jobs: Vec<Arc<dyn Job>>) -> Result<Self, PipelineError> {
        let mut names = HashSet::new();
        for job in &jobs {
            if !names.insert(job.name().to_string()) {
                return Err(PipelineError::Config(format!(
                    "job {:?} registered twice",
                    job.name()
                )));
            }
            validate_cron(job.cron())
                .map_err(|e| PipelineError::Config(format!("job {}: {e}", job.name())))?;
        }
        Ok(Self { jobs })
    }

    pub fn jobs(&self) -> &[Arc<dyn Job>] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.iter().find(|j| j.name() == name).cloned()
    }

    /// Run the named jobs one after another, in the given order.
    pub async fn run(&self, names: &[String]) -> Result<Vec<RunReport>, PipelineError> {
        let jobs = names
            .iter()
            .map(|n| {
                self.get(n)
                    .ok_or_else(|| PipelineError::Config(format!("unknown job {n:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            reports.push(job.run().await);
        }
        Ok(reports)
    }

    /// Run every job concurrently. Jobs write different batch keys and share
    /// the store pool.
    pub async fn run_all(&self) -> Vec<RunReport> {
        let mut tasks = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let job = Arc::clone(job);
            tasks.push(tokio::spawn(async move {
                info!(job = job.name(), "starting job");
                job.run().await
            }));
        }
        let mut reports = Vec::with_capacity(tasks.len());
        for res in join_all(tasks).await {
            match res {
                Ok(report) => reports.push(report),
                Err(join_err) => error!(error = %join_err, "job task panicked"),
            }
        }
        reports
    }
}
