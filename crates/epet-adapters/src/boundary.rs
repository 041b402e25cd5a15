//! Incremental boundary detection over a newest-first page stream.

use chrono::{DateTime, Utc};
use epet_core::{ChildRecord, HarvestWindow, Page};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("records out of order at page offset {offset}: {previous} is older than {next}")]
    OrderViolation {
        offset: usize,
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    },
}

/// What one page contributes to the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PageVerdict {
    pub fresh: Vec<ChildRecord>,
    /// Records created after the run's cutoff; the next run collects them.
    pub too_new: usize,
    pub already_seen: usize,
    /// No further page of this parent can hold fresh records.
    pub stop: bool,
}

/// Splits each page of one parent into too-new / fresh / already-seen segments.
#[derive(Debug, Clone)]
pub struct BoundaryResolver {
    window: HarvestWindow,
    last_seen: Option<DateTime<Utc>>,
}

impl BoundaryResolver {
    pub fn new(window: HarvestWindow) -> Self {
        Self {
            window,
            last_seen: None,
        }
    }

    pub fn window(&self) -> HarvestWindow {
        self.window
    }

    pub fn resolve_page(&mut self, page: Page) -> Result<PageVerdict, BoundaryError> {
        self.check_order(&page.items)?;

        let Page { mut items, is_last } = page;
        if items.is_empty() {
            return Ok(PageVerdict {
                fresh: Vec::new(),
                too_new: 0,
                already_seen: 0,
                stop: true,
            });
        }

        let window = self.window;
        let first_new = items.partition_point(|r| window.is_too_new(r.created_at));
        let first_old = items
            .partition_point(|r| !window.is_already_seen(r.created_at))
            .max(first_new);
        let len = items.len();
        self.last_seen = items.last().map(|r| r.created_at);

        items.truncate(first_old);
        let fresh = items.split_off(first_new);
        Ok(PageVerdict {
            fresh,
            too_new: first_new,
            already_seen: len - first_old,
            stop: first_old < len || is_last,
        })
    }

    fn check_order(&self, items: &[ChildRecord]) -> Result<(), BoundaryError> {
        if let (Some(previous), Some(first)) = (self.last_seen, items.first()) {
            if first.created_at > previous {
                return Err(BoundaryError::OrderViolation {
                    offset: 0,
                    previous,
                    next: first.created_at,
                });
            }
        }
        for (offset, pair) in items.windows(2).enumerate() {
            if pair[1].created_at > pair[0].created_at {
                return Err(BoundaryError::OrderViolation {
                    offset: offset + 1,
                    previous: pair[0].created_at,
                    next: pair[1].created_at,
                });
            }
        }
        Ok(())
    }
}
