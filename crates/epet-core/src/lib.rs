//! Core domain model for the e-petition harvester.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Duration, DurationRound, FixedOffset, NaiveDateTime, SecondsFormat, Utc,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "epet-core";

/// Watermark used when no checkpoint exists: collect from the beginning of time.
pub const EPOCH_SENTINEL: &str = "1900-01-01T00:00:00Z";

/// Upstream field carrying a child record's creation time.
pub const CREATED_FIELD: &str = "createdDate";
const CREATED_FIELD_ALIAS: &str = "createdAt";

/// Column under which the owning petition id is staged.
pub const PARENT_FIELD: &str = "petitionId";

/// Child record families, each with its own endpoint, staging prefix and watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Comments,
    Signers,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Comments, RecordKind::Signers];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Comments => "comments",
            RecordKind::Signers => "signers",
        }
    }

    /// Path segment below `<parents>/{parentId}/`.
    pub fn endpoint(self) -> &'static str {
        self.as_str()
    }

    /// Comments carry an upstream `id`; signatures only get a derived one, which
    /// two identical signatures share.
    pub fn has_upstream_id(self) -> bool {
        matches!(self, RecordKind::Comments)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comments" | "comment" => Ok(RecordKind::Comments),
            "signers" | "signer" | "signatures" => Ok(RecordKind::Signers),
            other => Err(format!("unknown record kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
}

/// Immutable child record (comment or signature) as harvested from the list API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: String,
    pub parent_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: Map<String, JsonValue>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record is missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}`: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: TimestampError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("unparseable timestamp `{0}`")]
    Invalid(String),
    #[error("timestamp `{0}` is ambiguous at the configured offset")]
    Ambiguous(String),
}

impl ChildRecord {
    /// Decode one element of a list page's `content` array.
    ///
    /// `id`, the creation timestamp and any upstream `petitionId` are lifted out;
    /// every other field stays in `payload`. Signatures carry no upstream id, so
    /// they get a UUIDv5 derived from parent, timestamp and payload.
    pub fn from_api(
        parent_id: &str,
        value: JsonValue,
        naive_offset: FixedOffset,
    ) -> Result<Self, RecordError> {
        let JsonValue::Object(mut payload) = value else {
            return Err(RecordError::NotAnObject);
        };

        let created_raw = payload
            .remove(CREATED_FIELD)
            .or_else(|| payload.remove(CREATED_FIELD_ALIAS))
            .ok_or(RecordError::MissingField(CREATED_FIELD))?;
        let created_text = created_raw
            .as_str()
            .ok_or(RecordError::MissingField(CREATED_FIELD))?;
        let created_at = parse_api_timestamp(created_text, naive_offset).map_err(|source| {
            RecordError::Timestamp {
                field: CREATED_FIELD,
                source,
            }
        })?;

        payload.remove(PARENT_FIELD);
        let id = match payload.remove("id") {
            Some(JsonValue::String(id)) if !id.is_empty() => id,
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => derived_record_id(parent_id, created_at, &payload),
        };

        Ok(Self {
            id,
            parent_id: parent_id.to_string(),
            created_at,
            payload,
        })
    }

    /// Flat row handed to the staging writer.
    pub fn to_staged_row(&self) -> Map<String, JsonValue> {
        let mut row = self.payload.clone();
        row.insert("id".to_string(), JsonValue::String(self.id.clone()));
        row.insert(
            PARENT_FIELD.to_string(),
            JsonValue::String(self.parent_id.clone()),
        );
        row.insert(
            CREATED_FIELD.to_string(),
            JsonValue::String(format_timestamp(self.created_at)),
        );
        row
    }
}

fn derived_record_id(
    parent_id: &str,
    created_at: DateTime<Utc>,
    payload: &Map<String, JsonValue>,
) -> String {
    let source = format!(
        "{}:{}:{}",
        parent_id,
        format_timestamp(created_at),
        JsonValue::Object(payload.clone())
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()).to_string()
}

/// One page of a parent's child list, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<ChildRecord>,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentPage {
    pub items: Vec<ParentRef>,
    pub is_last: bool,
    pub total_elements: Option<u64>,
}

/// Instant through which collection of one record kind is known to be complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    pub instant: DateTime<Utc>,
}

impl Watermark {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self { instant }
    }

    pub fn epoch() -> Self {
        let instant = DateTime::parse_from_rfc3339(EPOCH_SENTINEL)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { instant }
    }

    /// Checkpoint file content: a single RFC 3339 timestamp.
    pub fn to_checkpoint(&self) -> String {
        format_timestamp(self.instant)
    }

    /// Accepts RFC 3339 as well as the naive `YYYY-MM-DDTHH:MM:SS` form older
    /// checkpoints were written in, read at `naive_offset` like API timestamps.
    pub fn parse_checkpoint(text: &str, naive_offset: FixedOffset) -> Result<Self, TimestampError> {
        parse_api_timestamp(text, naive_offset).map(Self::new)
    }
}

/// The `(old, new]` interval a single run collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestWindow {
    pub old: DateTime<Utc>,
    pub new: DateTime<Utc>,
}

impl HarvestWindow {
    /// `new` is clamped up to `old` so the persisted watermark never moves backwards.
    pub fn new(old: DateTime<Utc>, new: DateTime<Utc>) -> Self {
        Self {
            old,
            new: new.max(old),
        }
    }

    /// Window for a run started at `run_started_at`: the upper bound is the start
    /// instant truncated to whole seconds minus `safety_margin`.
    pub fn for_run(previous: Watermark, run_started_at: DateTime<Utc>, safety_margin: Duration) -> Self {
        let truncated = run_started_at
            .duration_trunc(Duration::seconds(1))
            .unwrap_or(run_started_at);
        Self::new(previous.instant, truncated - safety_margin)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.old < instant && instant <= self.new
    }

    pub fn is_too_new(&self, instant: DateTime<Utc>) -> bool {
        instant > self.new
    }

    pub fn is_already_seen(&self, instant: DateTime<Utc>) -> bool {
        instant <= self.old
    }

    /// Watermark to persist once the run completes.
    pub fn next_watermark(&self) -> Watermark {
        Watermark::new(self.new)
    }
}

pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a timestamp as the list API emits it.
///
/// Offset-carrying values are converted to UTC; naive values are read at
/// `naive_offset`.
pub fn parse_api_timestamp(
    text: &str,
    naive_offset: FixedOffset,
) -> Result<DateTime<Utc>, TimestampError> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return naive
                .and_local_timezone(naive_offset)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| TimestampError::Ambiguous(text.to_string()));
        }
    }
    Err(TimestampError::Invalid(text.to_string()))
}
