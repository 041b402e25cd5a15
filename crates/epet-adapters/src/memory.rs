//! In-process `ListApi` with scripted page faults.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use epet_core::{ChildRecord, Page, ParentPage, ParentRef, RecordKind};
use epet_storage::FetchError;
use serde_json::{Map, Value as JsonValue};

use crate::ListApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRequest {
    pub kind: RecordKind,
    pub parent_id: String,
    pub size: usize,
    pub page: u64,
}

#[derive(Debug, Default)]
struct State {
    parents: Vec<String>,
    children: HashMap<(RecordKind, String), Vec<ChildRecord>>,
    faults: HashMap<(RecordKind, String, usize, u64), u16>,
    failing: HashMap<(RecordKind, String), u16>,
    details: HashMap<String, Map<String, JsonValue>>,
    requests: Vec<ChildRequest>,
}

#[derive(Debug, Default)]
pub struct InMemoryListApi {
    state: Mutex<State>,
}

fn status_error(status: u16, what: String) -> FetchError {
    FetchError::HttpStatus {
        status,
        url: format!("memory://{what}"),
    }
}

impl InMemoryListApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_parent(self, parent_id: &str) -> Self {
        self.state().parents.push(parent_id.to_string());
        self
    }

    /// Children are served newest first regardless of insertion order.
    pub fn with_children(self, kind: RecordKind, parent_id: &str, records: Vec<ChildRecord>) -> Self {
        self.replace_children(kind, parent_id, records);
        self
    }

    /// Children served exactly in the given order.
    pub fn with_raw_children(
        self,
        kind: RecordKind,
        parent_id: &str,
        records: Vec<ChildRecord>,
    ) -> Self {
        self.state()
            .children
            .insert((kind, parent_id.to_string()), records);
        self
    }

    /// Answer `status` for exactly this `(size, page)` request.
    pub fn with_fault(
        self,
        kind: RecordKind,
        parent_id: &str,
        size: usize,
        page: u64,
        status: u16,
    ) -> Self {
        self.state()
            .faults
            .insert((kind, parent_id.to_string(), size, page), status);
        self
    }

    /// Answer `status` for every child page of this parent.
    pub fn failing_parent(self, kind: RecordKind, parent_id: &str, status: u16) -> Self {
        self.state()
            .failing
            .insert((kind, parent_id.to_string()), status);
        self
    }

    pub fn with_detail(self, parent_id: &str, detail: Map<String, JsonValue>) -> Self {
        self.state().details.insert(parent_id.to_string(), detail);
        self
    }

    /// Replace a parent's children between runs.
    pub fn replace_children(&self, kind: RecordKind, parent_id: &str, mut records: Vec<ChildRecord>) {
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.state()
            .children
            .insert((kind, parent_id.to_string()), records);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.faults.clear();
        state.failing.clear();
    }

    pub fn requests(&self) -> Vec<ChildRequest> {
        self.state().requests.clone()
    }
}

fn slice_page<T: Clone>(items: &[T], size: usize, page: u64) -> (Vec<T>, bool) {
    let size = size.max(1);
    let start = usize::try_from(page)
        .ok()
        .and_then(|p| p.checked_mul(size))
        .unwrap_or(usize::MAX)
        .min(items.len());
    let end = start.saturating_add(size).min(items.len());
    (items[start..end].to_vec(), end >= items.len())
}

#[async_trait]
impl ListApi for InMemoryListApi {
    async fn parent_page(&self, size: usize, page: u64) -> Result<ParentPage, FetchError> {
        let state = self.state();
        let (ids, is_last) = slice_page(&state.parents, size, page);
        Ok(ParentPage {
            items: ids.into_iter().map(|id| ParentRef { id }).collect(),
            is_last,
            total_elements: Some(state.parents.len() as u64),
        })
    }

    async fn child_page(
        &self,
        kind: RecordKind,
        parent_id: &str,
        size: usize,
        page: u64,
    ) -> Result<Page, FetchError> {
        let mut state = self.state();
        state.requests.push(ChildRequest {
            kind,
            parent_id: parent_id.to_string(),
            size,
            page,
        });

        let key = (kind, parent_id.to_string());
        if let Some(status) = state.failing.get(&key) {
            return Err(status_error(*status, format!("{parent_id}/{kind}")));
        }
        if let Some(status) = state
            .faults
            .get(&(kind, parent_id.to_string(), size, page))
        {
            return Err(status_error(
                *status,
                format!("{parent_id}/{kind}?size={size}&page={page}"),
            ));
        }

        let records = state.children.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let (items, is_last) = slice_page(records, size, page);
        Ok(Page { items, is_last })
    }

    async fn petition_detail(&self, parent_id: &str) -> Result<Map<String, JsonValue>, FetchError> {
        self.state()
            .details
            .get(parent_id)
            .cloned()
            .ok_or_else(|| status_error(404, parent_id.to_string()))
    }
}
