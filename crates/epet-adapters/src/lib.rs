//! Remote list API contract, pagination and incremental collection per parent.

use std::collections::HashSet;
use std::ops::Range;

use async_trait::async_trait;
use chrono::FixedOffset;
use epet_core::{ChildRecord, HarvestWindow, Page, ParentPage, ParentRef, RecordKind};
use epet_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

mod boundary;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use boundary::{BoundaryError, BoundaryResolver, PageVerdict};

pub const CRATE_NAME: &str = "epet-adapters";

/// Status the list API answers with when one page range is poisoned.
pub const DEFAULT_PAGE_FAULT_STATUS: u16 = 500;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parent {parent_id}: {source}")]
    Boundary {
        parent_id: String,
        #[source]
        source: BoundaryError,
    },
}

#[async_trait]
pub trait ListApi: Send + Sync {
    async fn parent_page(&self, size: usize, page: u64) -> Result<ParentPage, FetchError>;

    /// One page of a parent's child list, newest first.
    async fn child_page(
        &self,
        kind: RecordKind,
        parent_id: &str,
        size: usize,
        page: u64,
    ) -> Result<Page, FetchError>;

    async fn petition_detail(&self, parent_id: &str) -> Result<Map<String, JsonValue>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    content: Vec<JsonValue>,
    last: bool,
    #[serde(rename = "totalElements", default)]
    total_elements: Option<u64>,
}

/// `ListApi` over the public e-petition REST endpoints.
#[derive(Debug)]
pub struct EpetitionApi {
    http: HttpFetcher,
    base_url: String,
    naive_offset: FixedOffset,
}

impl EpetitionApi {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, naive_offset: FixedOffset) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            naive_offset,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn envelope(&self, url: &str, size: usize, page: u64) -> Result<ListEnvelope, FetchError> {
        self.http
            .fetch_json(url, &[("size", size.to_string()), ("page", page.to_string())])
            .await
    }
}

fn id_text(value: &JsonValue) -> Option<String> {
    match value.get("id")? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ListApi for EpetitionApi {
    async fn parent_page(&self, size: usize, page: u64) -> Result<ParentPage, FetchError> {
        let url = format!("{}/short", self.base_url);
        let envelope = self.envelope(&url, size, page).await?;
        let items = envelope
            .content
            .iter()
            .map(|item| {
                id_text(item).map(|id| ParentRef { id }).ok_or_else(|| FetchError::Decode {
                    url: url.clone(),
                    message: "petition entry without id".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParentPage {
            items,
            is_last: envelope.last,
            total_elements: envelope.total_elements,
        })
    }

    async fn child_page(
        &self,
        kind: RecordKind,
        parent_id: &str,
        size: usize,
        page: u64,
    ) -> Result<Page, FetchError> {
        let url = format!("{}/{}/{}", self.base_url, parent_id, kind.endpoint());
        let envelope = self.envelope(&url, size, page).await?;
        let items = envelope
            .content
            .into_iter()
            .map(|item| {
                ChildRecord::from_api(parent_id, item, self.naive_offset).map_err(|err| {
                    FetchError::Decode {
                        url: url.clone(),
                        message: err.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            is_last: envelope.last,
        })
    }

    async fn petition_detail(&self, parent_id: &str) -> Result<Map<String, JsonValue>, FetchError> {
        let url = format!("{}/{}", self.base_url, parent_id);
        match self.http.fetch_json::<JsonValue>(&url, &[]).await? {
            JsonValue::Object(map) => Ok(map),
            _ => Err(FetchError::Decode {
                url,
                message: "petition detail is not an object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkSettings {
    pub page_size: usize,
    pub fault_status: u16,
}

impl WalkSettings {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            fault_status: DEFAULT_PAGE_FAULT_STATUS,
        }
    }
}

/// Lazy walk over one parent's child pages.
///
/// A page answering with the fault status is re-requested one record at a time
/// over the same offsets; singleton pages are yielded in order, and offsets that
/// fault again are skipped and remembered.
pub struct PageWalker<'a, A: ListApi + ?Sized> {
    api: &'a A,
    kind: RecordKind,
    parent_id: &'a str,
    settings: WalkSettings,
    next_index: u64,
    fallback: Option<Range<u64>>,
    finished: bool,
    requests: usize,
    skipped: Vec<u64>,
}

impl<'a, A: ListApi + ?Sized> PageWalker<'a, A> {
    pub fn new(api: &'a A, kind: RecordKind, parent_id: &'a str, settings: WalkSettings) -> Self {
        Self {
            api,
            kind,
            parent_id,
            settings: WalkSettings {
                page_size: settings.page_size.max(1),
                ..settings
            },
            next_index: 0,
            fallback: None,
            finished: false,
            requests: 0,
            skipped: Vec::new(),
        }
    }

    /// Record offsets lost to repeated page faults.
    pub fn skipped(&self) -> &[u64] {
        &self.skipped
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            if let Some(range) = self.fallback.as_mut() {
                let Some(offset) = range.next() else {
                    self.fallback = None;
                    continue;
                };
                self.requests += 1;
                match self.api.child_page(self.kind, self.parent_id, 1, offset).await {
                    Ok(page) => return Ok(Some(self.accept(page))),
                    Err(err) if err.status() == Some(self.settings.fault_status) => {
                        warn!(
                            parent_id = self.parent_id,
                            kind = %self.kind,
                            offset,
                            "record unreachable after page fault, skipping"
                        );
                        self.skipped.push(offset);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let index = self.next_index;
            self.next_index += 1;
            self.requests += 1;
            let size = self.settings.page_size;
            match self.api.child_page(self.kind, self.parent_id, size, index).await {
                Ok(page) => return Ok(Some(self.accept(page))),
                Err(err) if err.status() == Some(self.settings.fault_status) => {
                    let start = index * size as u64;
                    debug!(
                        parent_id = self.parent_id,
                        kind = %self.kind,
                        page = index,
                        "page fault, re-fetching range one record at a time"
                    );
                    self.fallback = Some(start..start + size as u64);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn accept(&mut self, page: Page) -> Page {
        if page.is_last || page.items.is_empty() {
            self.finished = true;
            self.fallback = None;
        }
        page
    }
}

/// Lazy walk over the parent list, yielding each parent id once per run.
pub struct ParentEnumerator<'a, A: ListApi + ?Sized> {
    api: &'a A,
    page_size: usize,
    next_index: u64,
    finished: bool,
    seen: HashSet<String>,
    total_elements: Option<u64>,
}

impl<'a, A: ListApi + ?Sized> ParentEnumerator<'a, A> {
    pub fn new(api: &'a A, page_size: usize) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
            next_index: 0,
            finished: false,
            seen: HashSet::new(),
            total_elements: None,
        }
    }

    pub fn total_elements(&self) -> Option<u64> {
        self.total_elements
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<ParentRef>>, FetchError> {
        if self.finished {
            return Ok(None);
        }
        let page = self.api.parent_page(self.page_size, self.next_index).await?;
        self.next_index += 1;
        self.total_elements = page.total_elements.or(self.total_elements);
        if page.is_last || page.items.is_empty() {
            self.finished = true;
        }

        let mut fresh = Vec::with_capacity(page.items.len());
        for parent in page.items {
            if self.seen.insert(parent.id.clone()) {
                fresh.push(parent);
            } else {
                debug!(parent_id = %parent.id, "parent listed twice, skipping repeat");
            }
        }
        Ok(Some(fresh))
    }
}

/// Outcome of collecting one parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentHarvest {
    pub parent_id: String,
    pub records: Vec<ChildRecord>,
    pub pages: usize,
    pub too_new: usize,
    pub duplicates: usize,
    pub skipped: Vec<u64>,
}

/// Collect the records of one parent that fall inside `window`, reading only
/// as many pages as needed to reach the previous watermark.
pub async fn collect_parent<A: ListApi + ?Sized>(
    api: &A,
    kind: RecordKind,
    parent_id: &str,
    window: HarvestWindow,
    settings: WalkSettings,
) -> Result<ParentHarvest, AdapterError> {
    let span = info_span!("harvest_parent", parent_id, kind = %kind);
    collect_parent_inner(api, kind, parent_id, window, settings)
        .instrument(span)
        .await
}

async fn collect_parent_inner<A: ListApi + ?Sized>(
    api: &A,
    kind: RecordKind,
    parent_id: &str,
    window: HarvestWindow,
    settings: WalkSettings,
) -> Result<ParentHarvest, AdapterError> {
    let mut walker = PageWalker::new(api, kind, parent_id, settings);
    let mut resolver = BoundaryResolver::new(window);
    let mut emitted: HashSet<String> = HashSet::new();
    let mut harvest = ParentHarvest {
        parent_id: parent_id.to_string(),
        records: Vec::new(),
        pages: 0,
        too_new: 0,
        duplicates: 0,
        skipped: Vec::new(),
    };

    while let Some(page) = walker.next_page().await? {
        harvest.pages += 1;
        let verdict = resolver
            .resolve_page(page)
            .map_err(|source| AdapterError::Boundary {
                parent_id: parent_id.to_string(),
                source,
            })?;
        harvest.too_new += verdict.too_new;
        for record in verdict.fresh {
            // Offset pagination shifts when records arrive mid-walk. Signatures
            // have no upstream id and identical ones are distinct rows.
            if !kind.has_upstream_id() || emitted.insert(record.id.clone()) {
                harvest.records.push(record);
            } else {
                harvest.duplicates += 1;
            }
        }
        if verdict.stop {
            break;
        }
    }

    harvest.skipped = walker.skipped().to_vec();
    debug!(
        pages = harvest.pages,
        records = harvest.records.len(),
        too_new = harvest.too_new,
        skipped = harvest.skipped.len(),
        "parent collected"
    );
    Ok(harvest)
}
