//! In-process relational store with the same key and reference rules as the
//! Postgres schema. Backs the loader tests and `load --dry-run`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::loader::{
    CommentRow, LookupEntry, LookupTable, PetitionRow, RelationalStore, SignerRow, StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: i64,
    pub name: Option<String>,
    pub url: Option<String>,
    pub mime_type_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComment {
    pub id: i64,
    pub petition_id: i64,
    pub row: CommentRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSigner {
    pub petition_id: i64,
    pub fio: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Every table, keyed by natural key where the schema has one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTables {
    pub named: BTreeMap<(LookupTable, String), i64>,
    pub organizations: BTreeMap<String, (i64, Option<String>)>,
    pub locations: BTreeMap<String, i64>,
    pub files: BTreeMap<String, StoredFile>,
    pub petitions: BTreeMap<String, (i64, PetitionRow)>,
    pub petition_files: BTreeSet<(i64, i64)>,
    pub comments: BTreeMap<String, StoredComment>,
    pub signers: Vec<StoredSigner>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: MemoryTables,
    next_id: i64,
    register_missing_parents: bool,
    failing_comments: BTreeSet<String>,
}

impl Inner {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn petition_for(&mut self, external_id: &str) -> Result<i64, StoreError> {
        if let Some((id, _)) = self.tables.petitions.get(external_id) {
            return Ok(*id);
        }
        if !self.register_missing_parents {
            return Err(StoreError::MissingParent(external_id.to_string()));
        }
        let id = self.allocate();
        self.tables.petitions.insert(
            external_id.to_string(),
            (
                id,
                PetitionRow {
                    external_id: external_id.to_string(),
                    ..PetitionRow::default()
                },
            ),
        );
        Ok(id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register unknown petitions on first reference instead of failing,
    /// so child batches can be rehearsed without a petition snapshot.
    pub fn registering_missing_parents() -> Self {
        let store = Self::default();
        store.lock().register_missing_parents = true;
        store
    }

    /// Fail the insert of this comment with a constraint error.
    pub fn fail_comment(&self, external_id: &str) {
        self.lock().failing_comments.insert(external_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_comments.clear();
    }

    pub fn tables(&self) -> MemoryTables {
        self.lock().tables.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn lookup_id(&self, entry: &LookupEntry) -> Result<Option<i64>, StoreError> {
        let inner = self.lock();
        let tables = &inner.tables;
        Ok(match entry {
            LookupEntry::Named { table, name } => tables.named.get(&(*table, name.clone())).copied(),
            LookupEntry::Organization { external_id, .. } => {
                tables.organizations.get(external_id).map(|(id, _)| *id)
            }
            LookupEntry::Location { natural_key, .. } => tables.locations.get(natural_key).copied(),
            LookupEntry::File { external_id, .. } => tables.files.get(external_id).map(|f| f.id),
        })
    }

    async fn insert_lookup(&self, entry: &LookupEntry) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match entry {
            LookupEntry::Named { table, name } => {
                let key = (*table, name.clone());
                if !inner.tables.named.contains_key(&key) {
                    let id = inner.allocate();
                    inner.tables.named.insert(key, id);
                }
            }
            LookupEntry::Organization { external_id, name } => {
                if !inner.tables.organizations.contains_key(external_id) {
                    let id = inner.allocate();
                    inner
                        .tables
                        .organizations
                        .insert(external_id.clone(), (id, name.clone()));
                }
            }
            LookupEntry::Location { natural_key, .. } => {
                if !inner.tables.locations.contains_key(natural_key) {
                    let id = inner.allocate();
                    inner.tables.locations.insert(natural_key.clone(), id);
                }
            }
            LookupEntry::File {
                external_id,
                name,
                url,
                mime_type_id,
            } => {
                if let Some(mime) = mime_type_id {
                    let known = inner
                        .tables
                        .named
                        .iter()
                        .any(|((table, _), id)| *table == LookupTable::MimeTypes && id == mime);
                    if !known {
                        return Err(StoreError::Constraint(format!(
                            "files.mime_type_id {mime} does not exist"
                        )));
                    }
                }
                if !inner.tables.files.contains_key(external_id) {
                    let id = inner.allocate();
                    inner.tables.files.insert(
                        external_id.clone(),
                        StoredFile {
                            id,
                            name: name.clone(),
                            url: url.clone(),
                            mime_type_id: *mime_type_id,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn petition_id(&self, external_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()
            .tables
            .petitions
            .get(external_id)
            .map(|(id, _)| *id))
    }

    async fn insert_petition(&self, row: &PetitionRow) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        if inner.tables.petitions.contains_key(&row.external_id) {
            return Err(StoreError::Constraint(format!(
                "petitions.external_id {} already exists",
                row.external_id
            )));
        }
        let id = inner.allocate();
        inner
            .tables
            .petitions
            .insert(row.external_id.clone(), (id, row.clone()));
        Ok(id)
    }

    async fn link_petition_file(&self, petition_id: i64, file_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .tables
            .petition_files
            .insert((petition_id, file_id)))
    }

    async fn comment_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().tables.comments.contains_key(external_id))
    }

    async fn insert_comment(&self, row: &CommentRow) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_comments.contains(&row.external_id) {
            return Err(StoreError::Constraint(format!(
                "comment {} rejected",
                row.external_id
            )));
        }
        if inner.tables.comments.contains_key(&row.external_id) {
            return Err(StoreError::Constraint(format!(
                "comments.external_id {} already exists",
                row.external_id
            )));
        }
        let petition_id = inner.petition_for(&row.petition_external_id)?;
        let id = inner.allocate();
        inner.tables.comments.insert(
            row.external_id.clone(),
            StoredComment {
                id,
                petition_id,
                row: row.clone(),
            },
        );
        Ok(())
    }

    async fn any_signer_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .tables
            .signers
            .iter()
            .any(|s| s.created_at >= since))
    }

    async fn append_signers(&self, rows: &[SignerRow]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        // All or nothing, like the single transaction in Postgres.
        let mut staged = Vec::with_capacity(rows.len());
        let snapshot = inner.tables.petitions.clone();
        let next_id = inner.next_id;
        for row in rows {
            match inner.petition_for(&row.petition_external_id) {
                Ok(petition_id) => staged.push(StoredSigner {
                    petition_id,
                    fio: row.fio.clone(),
                    created_at: row.created_at,
                }),
                Err(err) => {
                    inner.tables.petitions = snapshot;
                    inner.next_id = next_id;
                    return Err(err);
                }
            }
        }
        inner.tables.signers.extend(staged);
        Ok(rows.len())
    }
}
