//! Idempotent load of staged artifacts into the relational store.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use epet_core::{parse_api_timestamp, RecordKind, CREATED_FIELD, PARENT_FIELD};
use epet_storage::{list_staged_artifacts, read_staged_batch, StagedRow};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("petition {0} is not loaded")]
    MissingParent(String),
    #[error("{entity} {key} could not be resolved after insert")]
    Unresolved { entity: &'static str, key: String },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Staged datasets understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Petitions,
    Comments,
    Signers,
}

impl DatasetKind {
    pub fn prefix(self) -> &'static str {
        match self {
            DatasetKind::Petitions => "petitions",
            DatasetKind::Comments => RecordKind::Comments.as_str(),
            DatasetKind::Signers => RecordKind::Signers.as_str(),
        }
    }
}

impl From<RecordKind> for DatasetKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Comments => DatasetKind::Comments,
            RecordKind::Signers => DatasetKind::Signers,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "petitions" => Ok(DatasetKind::Petitions),
            other => other.parse::<RecordKind>().map(DatasetKind::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LookupTable {
    States,
    Sources,
    Languages,
    MimeTypes,
}

impl LookupTable {
    pub fn table_name(self) -> &'static str {
        match self {
            LookupTable::States => "states",
            LookupTable::Sources => "sources",
            LookupTable::Languages => "languages",
            LookupTable::MimeTypes => "mime_types",
        }
    }
}

/// A leaf entity keyed by its natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEntry {
    Named {
        table: LookupTable,
        name: String,
    },
    Organization {
        external_id: String,
        name: Option<String>,
    },
    Location {
        natural_key: String,
        latitude: Option<String>,
        longitude: Option<String>,
        address: Option<String>,
    },
    File {
        external_id: String,
        name: Option<String>,
        url: Option<String>,
        mime_type_id: Option<i64>,
    },
}

impl LookupEntry {
    pub fn entity(&self) -> &'static str {
        match self {
            LookupEntry::Named { table, .. } => table.table_name(),
            LookupEntry::Organization { .. } => "organizations",
            LookupEntry::Location { .. } => "locations",
            LookupEntry::File { .. } => "files",
        }
    }

    pub fn natural_key(&self) -> &str {
        match self {
            LookupEntry::Named { name, .. } => name,
            LookupEntry::Organization { external_id, .. } => external_id,
            LookupEntry::Location { natural_key, .. } => natural_key,
            LookupEntry::File { external_id, .. } => external_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRow {
    pub external_id: String,
    pub petition_external_id: String,
    pub parent_external_id: Option<String>,
    pub fio: Option<String>,
    pub body: Option<String>,
    pub replies_count: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerRow {
    pub petition_external_id: String,
    pub fio: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Petition scalar fields plus resolved foreign keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PetitionRow {
    pub external_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub reg_number: Option<String>,
    pub state_id: Option<i64>,
    pub source_id: Option<i64>,
    pub language_id: Option<i64>,
    pub apply_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub signers_count: Option<i32>,
    pub required_count: Option<i32>,
    pub viewers_count: Option<i32>,
    pub cover_file_id: Option<i64>,
    pub applicant_first_name: Option<String>,
    pub applicant_last_name: Option<String>,
    pub organization_id: Option<i64>,
    pub location_id: Option<i64>,
    pub decision_message_kk: Option<String>,
    pub decision_message_ru: Option<String>,
    pub decision_reply_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn lookup_id(&self, entry: &LookupEntry) -> Result<Option<i64>, StoreError>;

    /// Insert unless the natural key is already present.
    async fn insert_lookup(&self, entry: &LookupEntry) -> Result<(), StoreError>;

    async fn petition_id(&self, external_id: &str) -> Result<Option<i64>, StoreError>;

    /// Insert the whole petition row atomically and return its surrogate id.
    async fn insert_petition(&self, row: &PetitionRow) -> Result<i64, StoreError>;

    /// Returns `false` when the pair was already linked.
    async fn link_petition_file(&self, petition_id: i64, file_id: i64) -> Result<bool, StoreError>;

    async fn comment_exists(&self, external_id: &str) -> Result<bool, StoreError>;

    async fn insert_comment(&self, row: &CommentRow) -> Result<(), StoreError>;

    async fn any_signer_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Append every row in one transaction.
    async fn append_signers(&self, rows: &[SignerRow]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub dataset: DatasetKind,
    pub source: Option<PathBuf>,
    pub rows: usize,
    pub inserted: usize,
    pub already_present: usize,
    /// The whole batch was recognised as a replay and left out.
    pub batch_skipped: bool,
}

impl LoadReport {
    fn empty(dataset: DatasetKind, rows: usize) -> Self {
        Self {
            dataset,
            source: None,
            rows,
            inserted: 0,
            already_present: 0,
            batch_skipped: false,
        }
    }
}

/// Applies staged batches to a [`RelationalStore`], checking natural keys first
/// so any batch can be replayed safely.
pub struct Reconciler<S> {
    store: S,
    naive_offset: FixedOffset,
    keep_artifacts: bool,
}

impl<S: RelationalStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            naive_offset: Utc.fix(),
            keep_artifacts: false,
        }
    }

    pub fn with_naive_offset(mut self, offset: FixedOffset) -> Self {
        self.naive_offset = offset;
        self
    }

    /// Leave artifacts in place after loading them.
    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Existence check, conditional insert, then an authoritative lookup.
    pub async fn resolve_or_create(&self, entry: &LookupEntry) -> Result<i64, StoreError> {
        if let Some(id) = self.store.lookup_id(entry).await? {
            return Ok(id);
        }
        self.store.insert_lookup(entry).await?;
        self.store
            .lookup_id(entry)
            .await?
            .ok_or_else(|| StoreError::Unresolved {
                entity: entry.entity(),
                key: entry.natural_key().to_string(),
            })
    }

    pub async fn load_comments(&self, rows: &[StagedRow]) -> Result<LoadReport> {
        let mut comments = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                comment_row(row, self.naive_offset)
                    .with_context(|| format!("staged comment row {}", index + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        // Replies reference earlier comments; insert oldest first.
        comments.sort_by_key(|c| c.created_at);

        let mut report = LoadReport::empty(DatasetKind::Comments, comments.len());
        for comment in &comments {
            if self.store.comment_exists(&comment.external_id).await? {
                report.already_present += 1;
                continue;
            }
            self.store
                .insert_comment(comment)
                .await
                .with_context(|| format!("inserting comment {}", comment.external_id))?;
            report.inserted += 1;
        }
        Ok(report)
    }

    pub async fn load_signers(&self, rows: &[StagedRow]) -> Result<LoadReport> {
        let mut signers = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                signer_row(row, self.naive_offset)
                    .with_context(|| format!("staged signer row {}", index + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        signers.sort_by_key(|s| s.created_at);

        let mut report = LoadReport::empty(DatasetKind::Signers, signers.len());
        let Some(batch_start) = signers.first().map(|s| s.created_at) else {
            return Ok(report);
        };
        if self.store.any_signer_since(batch_start).await? {
            warn!(
                batch_start = %batch_start,
                rows = signers.len(),
                "signers at or after batch start already loaded, treating batch as a replay"
            );
            report.batch_skipped = true;
            report.already_present = signers.len();
            return Ok(report);
        }
        report.inserted = self
            .store
            .append_signers(&signers)
            .await
            .context("appending signers")?;
        Ok(report)
    }

    pub async fn load_petitions(&self, rows: &[StagedRow]) -> Result<LoadReport> {
        let mut report = LoadReport::empty(DatasetKind::Petitions, rows.len());
        for (index, row) in rows.iter().enumerate() {
            let record = PetitionRecord::from_staged(row, self.naive_offset)
                .with_context(|| format!("staged petition row {}", index + 1))?;
            let inserted = self
                .load_petition(&record)
                .await
                .with_context(|| format!("loading petition {}", record.row.external_id))?;
            if inserted {
                report.inserted += 1;
            } else {
                report.already_present += 1;
            }
        }
        Ok(report)
    }

    /// Dependencies first, then the root row, then file links.
    async fn load_petition(&self, record: &PetitionRecord) -> Result<bool, StoreError> {
        let mut file_ids = Vec::with_capacity(record.files.len());
        for file in &record.files {
            file_ids.push(self.resolve_file(file).await?);
        }

        let (petition_id, inserted) = match self.store.petition_id(&record.row.external_id).await? {
            Some(id) => (id, false),
            None => {
                let mut row = record.row.clone();
                row.state_id = self.resolve_named(LookupTable::States, &record.state).await?;
                row.source_id = self.resolve_named(LookupTable::Sources, &record.source).await?;
                row.language_id = self
                    .resolve_named(LookupTable::Languages, &record.language)
                    .await?;
                if let Some(cover) = &record.cover_file {
                    row.cover_file_id = Some(self.resolve_file(cover).await?);
                }
                if let Some(organization) = &record.organization {
                    row.organization_id = Some(self.resolve_or_create(organization).await?);
                }
                if let Some(location) = &record.location {
                    row.location_id = Some(self.resolve_or_create(location).await?);
                }
                (self.store.insert_petition(&row).await?, true)
            }
        };

        for file_id in file_ids {
            self.store.link_petition_file(petition_id, file_id).await?;
        }
        Ok(inserted)
    }

    async fn resolve_named(
        &self,
        table: LookupTable,
        name: &Option<String>,
    ) -> Result<Option<i64>, StoreError> {
        match name {
            Some(name) => {
                let entry = LookupEntry::Named {
                    table,
                    name: name.clone(),
                };
                self.resolve_or_create(&entry).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn resolve_file(&self, file: &FileRef) -> Result<i64, StoreError> {
        let mime_type_id = self
            .resolve_named(LookupTable::MimeTypes, &file.mime_type)
            .await?;
        self.resolve_or_create(&LookupEntry::File {
            external_id: file.external_id.clone(),
            name: file.name.clone(),
            url: file.url.clone(),
            mime_type_id,
        })
        .await
    }

    pub async fn load_rows(&self, dataset: DatasetKind, rows: &[StagedRow]) -> Result<LoadReport> {
        match dataset {
            DatasetKind::Petitions => self.load_petitions(rows).await,
            DatasetKind::Comments => self.load_comments(rows).await,
            DatasetKind::Signers => self.load_signers(rows).await,
        }
    }

    /// Load one finalized artifact; it is removed only after a successful load.
    pub async fn load_artifact(&self, dataset: DatasetKind, path: &Path) -> Result<LoadReport> {
        self.load_artifact_inner(dataset, path, true).await
    }

    /// Load an artifact picked by hand, possibly out of stamp order. A signer
    /// batch skipped as already loaded is kept, since a newer batch loaded
    /// first also trips the replay check.
    pub async fn load_selected(&self, dataset: DatasetKind, path: &Path) -> Result<LoadReport> {
        self.load_artifact_inner(dataset, path, false).await
    }

    async fn load_artifact_inner(
        &self,
        dataset: DatasetKind,
        path: &Path,
        consume_skipped: bool,
    ) -> Result<LoadReport> {
        let span = info_span!("load_artifact", dataset = %dataset, path = %path.display());
        async {
            let rows = read_staged_batch(path)?;
            let mut report = self.load_rows(dataset, &rows).await?;
            report.source = Some(path.to_path_buf());
            info!(
                rows = report.rows,
                inserted = report.inserted,
                already_present = report.already_present,
                batch_skipped = report.batch_skipped,
                "artifact loaded"
            );
            if report.batch_skipped && !consume_skipped {
                warn!("signer batch overlaps loaded rows, artifact kept; load pending artifacts oldest first");
            } else if !self.keep_artifacts {
                remove_artifact(path)?;
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Load every finalized artifact of `dataset` in `dir`, oldest first.
    /// Stops at the first failure, leaving that artifact and later ones in place.
    pub async fn load_pending(&self, dir: &Path, dataset: DatasetKind) -> Result<Vec<LoadReport>> {
        let artifacts = list_staged_artifacts(dir, dataset.prefix())?;
        debug!(dataset = %dataset, pending = artifacts.len(), "pending artifacts");
        let mut reports = Vec::with_capacity(artifacts.len());
        for path in artifacts {
            reports.push(
                self.load_artifact(dataset, &path)
                    .await
                    .with_context(|| format!("loading {}", path.display()))?,
            );
        }
        Ok(reports)
    }
}

fn remove_artifact(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing loaded artifact {}", path.display())),
    }
}

fn timestamp_cell(
    row: &StagedRow,
    column: &str,
    offset: FixedOffset,
) -> Result<Option<DateTime<Utc>>> {
    row.get(column)
        .map(|text| {
            parse_api_timestamp(text, offset).with_context(|| format!("column `{column}`"))
        })
        .transpose()
}

fn int_cell(row: &StagedRow, column: &str) -> Result<Option<i32>> {
    row.get(column)
        .map(|text| {
            text.trim()
                .parse::<i32>()
                .with_context(|| format!("column `{column}` is not an integer: {text}"))
        })
        .transpose()
}

fn owned(row: &StagedRow, column: &str) -> Option<String> {
    row.get(column).map(str::to_string)
}

pub(crate) fn comment_row(row: &StagedRow, offset: FixedOffset) -> Result<CommentRow> {
    Ok(CommentRow {
        external_id: row.require("id")?.to_string(),
        petition_external_id: row.require(PARENT_FIELD)?.to_string(),
        parent_external_id: owned(row, "parentId"),
        fio: owned(row, "fio"),
        body: owned(row, "comment"),
        replies_count: int_cell(row, "repliesCount")?,
        created_at: timestamp_cell(row, CREATED_FIELD, offset)?
            .with_context(|| format!("staged row is missing `{CREATED_FIELD}`"))?,
    })
}

pub(crate) fn signer_row(row: &StagedRow, offset: FixedOffset) -> Result<SignerRow> {
    Ok(SignerRow {
        petition_external_id: row.require(PARENT_FIELD)?.to_string(),
        fio: owned(row, "fio"),
        created_at: timestamp_cell(row, CREATED_FIELD, offset)?
            .with_context(|| format!("staged row is missing `{CREATED_FIELD}`"))?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileRef {
    external_id: String,
    name: Option<String>,
    url: Option<String>,
    mime_type: Option<String>,
}

/// A staged petition detail with its dependencies still unresolved.
#[derive(Debug, Clone, PartialEq)]
struct PetitionRecord {
    row: PetitionRow,
    state: Option<String>,
    source: Option<String>,
    language: Option<String>,
    cover_file: Option<FileRef>,
    files: Vec<FileRef>,
    organization: Option<LookupEntry>,
    location: Option<LookupEntry>,
}

/// Nested detail fields are staged as JSON text; plain text stays a string.
fn json_cell(row: &StagedRow, column: &str) -> Option<JsonValue> {
    let text = row.get(column)?;
    match serde_json::from_str::<JsonValue>(text) {
        Ok(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => Some(value),
        _ => Some(JsonValue::String(text.to_string())),
    }
}

fn text_field(map: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lookup_name(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => text_field(map, &["code", "name", "nameRu", "nameKk", "value"]),
        _ => None,
    }
}

fn file_ref(value: &JsonValue) -> Option<FileRef> {
    let map = value.as_object()?;
    Some(FileRef {
        external_id: text_field(map, &["id", "uuid"])?,
        name: text_field(map, &["name", "fileName", "originalName"]),
        url: text_field(map, &["url", "link"]),
        mime_type: text_field(map, &["mimeType", "contentType", "type"]),
    })
}

impl PetitionRecord {
    fn from_staged(row: &StagedRow, offset: FixedOffset) -> Result<Self> {
        let object = |column: &str| match json_cell(row, column) {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        };
        let applicant = object("applicant").unwrap_or_default();
        let decision = object("decision").unwrap_or_default();
        let decision_reply_date = match text_field(&decision, &["replyDate"]) {
            Some(text) => Some(
                parse_api_timestamp(&text, offset).context("column `decision.replyDate`")?,
            ),
            None => timestamp_cell(row, "decisionReplyDate", offset)?,
        };

        let organization = object("organization").and_then(|map| {
            Some(LookupEntry::Organization {
                external_id: text_field(&map, &["id", "uuid", "bin"])?,
                name: text_field(&map, &["name", "nameRu", "nameKk"]),
            })
        });
        let location = object("location").and_then(|map| {
            let latitude = text_field(&map, &["latitude", "lat"]);
            let longitude = text_field(&map, &["longitude", "lng", "lon"]);
            let address = text_field(&map, &["address"]);
            if latitude.is_none() && longitude.is_none() && address.is_none() {
                return None;
            }
            let natural_key = format!(
                "{},{}|{}",
                latitude.as_deref().unwrap_or_default(),
                longitude.as_deref().unwrap_or_default(),
                address.as_deref().unwrap_or_default()
            );
            Some(LookupEntry::Location {
                natural_key,
                latitude,
                longitude,
                address,
            })
        });
        let files = match json_cell(row, "files") {
            Some(JsonValue::Array(items)) => items.iter().filter_map(file_ref).collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            row: PetitionRow {
                external_id: row.require("id")?.to_string(),
                title: owned(row, "title"),
                description: owned(row, "description"),
                reg_number: owned(row, "regNumber"),
                apply_date: timestamp_cell(row, "applyDate", offset)?,
                deadline: timestamp_cell(row, "deadline", offset)?,
                signers_count: int_cell(row, "signersCount")?,
                required_count: int_cell(row, "requiredCount")?,
                viewers_count: int_cell(row, "viewersCount")?,
                applicant_first_name: text_field(&applicant, &["firstName"])
                    .or_else(|| owned(row, "applicantFirstName")),
                applicant_last_name: text_field(&applicant, &["lastName"])
                    .or_else(|| owned(row, "applicantLastName")),
                decision_message_kk: text_field(&decision, &["messageKk"]),
                decision_message_ru: text_field(&decision, &["messageRu"]),
                decision_reply_date,
                ..PetitionRow::default()
            },
            state: json_cell(row, "state").as_ref().and_then(lookup_name),
            source: json_cell(row, "source").as_ref().and_then(lookup_name),
            language: json_cell(row, "language").as_ref().and_then(lookup_name),
            cover_file: json_cell(row, "coverFile").as_ref().and_then(file_ref),
            files,
            organization,
            location,
        })
    }
}
