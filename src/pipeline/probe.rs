//! Boundary search for ranked listings that never report their length.
//!
//! Walk forward by `step` while pages come back full, halve the step and
//! back off when a page comes back empty, stop on the first short page.

use tracing::{debug, info, instrument};

use crate::pipeline::error::PipelineError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::source::{ItemSource, SourceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub initial_offset: u64,
    pub initial_step: u64,
    pub page_size: usize,
    pub max_tries: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_offset: 0,
            initial_step: 2000,
            page_size: 20,
            max_tries: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub last_rank: u64,
    /// Page fetches used, the terminal one included.
    pub tries: u32,
}

#[instrument(skip(source, retry))]
pub async fn probe<S: ItemSource>(
    source: &S,
    cfg: ProbeConfig,
    retry: &RetryPolicy,
) -> Result<ProbeResult, PipelineError> {
    if cfg.page_size == 0 || cfg.initial_step == 0 {
        return Err(PipelineError::Config(
            "probe page size and step must be positive".into(),
        ));
    }
    let mut offset = cfg.initial_offset;
    let mut step = cfg.initial_step;

    for attempt in 1..=cfg.max_tries {
        let page = retry
            .run("probe_page", || source.fetch_page(offset))
            .await?;
        let len = page.len();

        if len >= cfg.page_size {
            debug!(attempt, offset, step, "full page; expanding");
            offset += step;
        } else if len == 0 {
            step = (step / 2).max(1);
            offset = offset.saturating_sub(step);
            debug!(attempt, offset, step, "overshot; contracting");
        } else {
            let last_rank = page
                .records
                .last()
                .and_then(|r| r.rank())
                .unwrap_or(offset + len as u64);
            info!(last_rank, tries = attempt, "boundary found");
            return Ok(ProbeResult {
                last_rank,
                tries: attempt,
            });
        }
    }

    Err(PipelineError::ProbeDidNotConverge {
        tries: cfg.max_tries,
        offset,
        step,
    })
}
