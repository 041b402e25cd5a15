//! Append-only CSV staging artifacts.
//!
//! A run streams rows into a hidden `.partial` file next to its target and only
//! links it into place in [`StagingWriter::finish`]. Anything that never gets
//! there (an error, a dropped future, a killed process) leaves no file with the
//! final name, so the loader can never pick up a partial batch.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const STAMP_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
    pub byte_size: u64,
}

pub struct StagingWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<csv::Writer<File>>,
    header: Option<Vec<String>>,
    dropped_columns: HashSet<String>,
    rows: usize,
    settled: bool,
}

impl StagingWriter {
    /// Fails if an artifact with this name is already staged; a staged batch
    /// is never replaced before it is loaded.
    pub fn create(final_path: impl Into<PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        if final_path.exists() {
            bail!(
                "staged artifact {} already exists and has not been loaded",
                final_path.display()
            );
        }
        let parent = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating staging directory {}", parent.display()))?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch.csv".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.partial", Uuid::new_v4()));

        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening staging temp file {}", temp_path.display()))?;

        Ok(Self {
            final_path,
            temp_path,
            writer: Some(csv::Writer::from_writer(file)),
            header: None,
            dropped_columns: HashSet::new(),
            rows: 0,
            settled: false,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append rows. The first row ever written fixes the header.
    pub fn append_rows(&mut self, rows: &[Map<String, JsonValue>]) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .context("staging writer already closed")?;

        for row in rows {
            if self.header.is_none() {
                let columns: Vec<String> = row.keys().cloned().collect();
                writer
                    .write_record(&columns)
                    .with_context(|| format!("writing header to {}", self.temp_path.display()))?;
                self.header = Some(columns);
            }
            let header = self.header.get_or_insert_with(Vec::new);

            for key in row.keys() {
                if !header.contains(key) && self.dropped_columns.insert(key.clone()) {
                    warn!(column = %key, path = %self.final_path.display(), "dropping column absent from staging header");
                }
            }

            writer
                .write_record(header.iter().map(|column| cell_text(row.get(column))))
                .with_context(|| format!("writing row to {}", self.temp_path.display()))?;
            self.rows += 1;
        }
        Ok(rows.len())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .with_context(|| format!("flushing {}", self.temp_path.display()))?;
        }
        Ok(())
    }

    /// Make the artifact visible under its final name.
    pub fn finish(mut self) -> Result<StagedArtifact> {
        let writer = self
            .writer
            .take()
            .context("staging writer already closed")?;
        let file = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing {}: {}", self.temp_path.display(), err.error()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", self.temp_path.display()))?;
        drop(file);

        // Never replaces an existing artifact, even one published since `create`.
        fs::hard_link(&self.temp_path, &self.final_path).with_context(|| {
            format!(
                "publishing staging file {} -> {}",
                self.temp_path.display(),
                self.final_path.display()
            )
        })?;
        self.settled = true;
        if let Err(err) = remove_if_exists(&self.temp_path) {
            warn!(error = %err, path = %self.temp_path.display(), "failed to remove published staging temp file");
        }

        let bytes = fs::read(&self.final_path)
            .with_context(|| format!("reading back {}", self.final_path.display()))?;
        Ok(StagedArtifact {
            path: self.final_path.clone(),
            rows: self.rows,
            sha256: sha256_hex(&bytes),
            byte_size: bytes.len() as u64,
        })
    }

    /// [`append_rows`](Self::append_rows) plus a flush, run on the blocking pool.
    pub async fn write_batch(self, rows: Vec<Map<String, JsonValue>>) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            let mut writer = self;
            writer.append_rows(&rows)?;
            writer.flush()?;
            Ok(writer)
        })
        .await
        .context("staging write task failed")?
    }

    /// [`finish`](Self::finish) on the blocking pool.
    pub async fn publish(self) -> Result<StagedArtifact> {
        tokio::task::spawn_blocking(move || self.finish())
            .await
            .context("staging publish task failed")?
    }

    /// Delete everything written so far.
    pub fn discard(mut self) -> Result<()> {
        self.writer.take();
        self.settled = true;
        remove_if_exists(&self.temp_path)
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.writer.take();
        if let Err(err) = remove_if_exists(&self.temp_path) {
            warn!(error = %err, path = %self.temp_path.display(), "failed to remove abandoned staging file");
        } else {
            debug!(path = %self.temp_path.display(), "removed abandoned staging file");
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One staged row keyed by header column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedRow {
    cells: BTreeMap<String, String>,
}

impl StagedRow {
    pub fn from_cells<I, K, V>(cells: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cells: cells
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Cell text, with empty cells read as absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, column: &str) -> Result<&str> {
        self.get(column)
            .with_context(|| format!("staged row is missing `{column}`"))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }
}

/// Read a finalized artifact. A zero-byte file is a valid empty batch.
pub fn read_staged_batch(path: impl AsRef<Path>) -> Result<Vec<StagedRow>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let header = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        rows.push(StagedRow::from_cells(
            header.iter().zip(record.iter()),
        ));
    }
    Ok(rows)
}

pub fn staged_artifact_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}_{}.csv", at.format(STAMP_FORMAT))
}

fn artifact_stamp(file_name: &str, prefix: &str) -> Option<NaiveDateTime> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
    let stamp = rest.strip_suffix(".csv")?;
    if stamp.len() != STAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

/// Finalized artifacts for `prefix` in `dir`, oldest first.
pub fn list_staged_artifacts(dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stamp) = artifact_stamp(&name, prefix) {
            found.push((stamp, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}
