use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::model::BatchKey;

/// Lifecycle of one run. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Checking,
    Fetching,
    Skipped,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RunOutcome> for RunState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => Self::Succeeded,
            RunOutcome::Failed => Self::Failed,
            RunOutcome::Skipped => Self::Skipped,
        }
    }
}

/// What a run returns and what notifiers receive.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub fetcher: String,
    pub collection: String,
    pub batch: BatchKey,
    pub outcome: RunOutcome,
    /// Records committed by this run.
    pub record_count: usize,
    pub item_errors: usize,
    pub duration_ms: u64,
    /// Transient failures retried during the run.
    pub retries: u32,
    pub message: Option<String>,
}

impl RunReport {
    pub fn is_failed(&self) -> bool {
        self.outcome == RunOutcome::Failed
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} [{}] {} records in {} ms",
            self.fetcher, self.outcome, self.batch, self.record_count, self.duration_ms
        );
        if let Some(msg) = &self.message {
            line.push_str(": ");
            line.push_str(msg);
        }
        line
    }
}
