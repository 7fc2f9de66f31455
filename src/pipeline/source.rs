//! Item source contract and the offset-walking paginator built on it.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::pipeline::error::{PipelineError, SourceError};
use crate::pipeline::retry::RetryPolicy;

/// One upstream row. Immutable once fetched.
pub trait SourceRecord: Debug + Clone + Send + Sync + 'static {
    /// Upstream-reported 1-based rank, for ranked listings.
    fn rank(&self) -> Option<u64> {
        None
    }

    /// Stable identifier used in logs and as the fallback partition key.
    fn record_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(records: Vec<T>, has_more: bool) -> Self {
        Self { records, has_more }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One external listing. Re-requesting the same offset after a transient
/// failure must return equivalent data.
#[async_trait]
pub trait ItemSource: Send + Sync + 'static {
    type Item: SourceRecord;

    fn page_size(&self) -> usize;

    /// Records starting at the 0-based `offset`.
    async fn fetch_page(&self, offset: u64) -> Result<Page<Self::Item>, SourceError>;
}

/// Lazy, finite walk over an [`ItemSource`] starting at a given offset.
///
/// Restartable by building a new paginator; once it has returned an error
/// or run dry it keeps returning `Ok(None)`.
pub struct Paginator<S: ItemSource> {
    source: Arc<S>,
    retry: RetryPolicy,
    start_offset: u64,
    next_offset: u64,
    max_count: Option<usize>,
    yielded: usize,
    buffer: VecDeque<S::Item>,
    upstream_done: bool,
    fused: bool,
    pages: u32,
}

impl<S: ItemSource> Paginator<S> {
    pub fn new(source: Arc<S>, start_offset: u64, max_count: Option<usize>, retry: RetryPolicy) -> Self {
        Self {
            source,
            retry,
            start_offset,
            next_offset: start_offset,
            max_count,
            yielded: 0,
            buffer: VecDeque::new(),
            upstream_done: false,
            fused: false,
            pages: 0,
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next_item(&mut self) -> Result<Option<S::Item>, PipelineError> {
        loop {
            if self.fused {
                return Ok(None);
            }
            if self.max_count.is_some_and(|max| self.yielded >= max) {
                debug!(max = self.yielded, "max count reached");
                self.fused = true;
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                // Ranks at or below the resume offset are already committed.
                if item.rank().is_some_and(|rank| rank <= self.start_offset) {
                    trace!(rank = item.rank(), start = self.start_offset, "skipping covered rank");
                    continue;
                }
                self.yielded += 1;
                return Ok(Some(item));
            }
            if self.upstream_done {
                self.fused = true;
                return Ok(None);
            }

            let offset = self.next_offset;
            let source = &self.source;
            let fetched = self
                .retry
                .run("fetch_page", || source.fetch_page(offset))
                .await;
            let page = match fetched {
                Ok(page) => page,
                Err(e) => {
                    self.fused = true;
                    return Err(e.into());
                }
            };
            self.pages += 1;
            trace!(offset, len = page.len(), has_more = page.has_more, "page fetched");
            if page.is_empty() {
                self.upstream_done = true;
                continue;
            }
            self.next_offset += page.len() as u64;
            self.upstream_done = !page.has_more;
            self.buffer.extend(page.records);
        }
    }

    /// Drain the remaining items. Meant for small listings and tests.
    pub async fn collect_all(mut self) -> Result<Vec<S::Item>, PipelineError> {
        let mut out = Vec::new();
        while let Some(item) = self.next_item().await? {
            out.push(item);
        }
        Ok(out)
    }
}
