//! Deterministic in-memory item source for tests and dry runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::error::SourceError;
use crate::pipeline::source::{ItemSource, Page, SourceRecord};

/// Minimal ranked row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub rank: u64,
    pub id: String,
    pub value: i64,
}

impl SourceRecord for RankedItem {
    fn rank(&self) -> Option<u64> {
        Some(self.rank)
    }

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

pub struct MemorySource<T> {
    items: Vec<T>,
    page_size: usize,
    page_aligned: bool,
    rate_limited_from: Option<u64>,
    transient_failures: AtomicU32,
    calls: Mutex<Vec<u64>>,
}

impl<T: SourceRecord> MemorySource<T> {
    pub fn new(items: Vec<T>, page_size: usize) -> Self {
        Self {
            items,
            page_size: page_size.max(1),
            page_aligned: false,
            rate_limited_from: None,
            transient_failures: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Serve whole pages only: offsets are rounded down to a page boundary.
    pub fn page_aligned(mut self) -> Self {
        self.page_aligned = true;
        self
    }

    /// Every fetch at or past `offset` reports a rate limit.
    pub fn rate_limited_from(mut self, offset: u64) -> Self {
        self.rate_limited_from = Some(offset);
        self
    }

    /// The next `n` fetches time out.
    pub fn fail_transiently(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Offsets requested so far, in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl MemorySource<RankedItem> {
    /// Ranks `1..=total`, ids `item-<rank>`.
    pub fn ranked(total: u64, page_size: usize) -> Self {
        let items = (1..=total)
            .map(|rank| RankedItem {
                rank,
                id: format!("item-{rank}"),
                value: rank as i64 * 10,
            })
            .collect();
        Self::new(items, page_size)
    }
}

#[async_trait]
impl<T: SourceRecord> ItemSource for MemorySource<T> {
    type Item = T;

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, offset: u64) -> Result<Page<T>, SourceError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(offset);

        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Timeout(format!("injected timeout at {offset}")));
        }
        if self.rate_limited_from.is_some_and(|from| offset >= from) {
            return Err(SourceError::RateLimited { retry_after: None });
        }

        let mut start = usize::try_from(offset).unwrap_or(usize::MAX);
        if self.page_aligned {
            start -= start % self.page_size;
        }
        if start >= self.items.len() {
            return Ok(Page::empty());
        }
        let end = (start + self.page_size).min(self.items.len());
        Ok(Page::new(self.items[start..end].to_vec(), end < self.items.len()))
    }
}
