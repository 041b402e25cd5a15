use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use epet_core::{RecordKind, Watermark};
use tracing::{debug, warn};
use uuid::Uuid;

/// Persistence port for per-kind watermarks.
pub trait WatermarkStore: Send + Sync {
    fn read(&self) -> Result<Option<Watermark>>;

    fn write(&self, watermark: Watermark) -> Result<()>;

    /// The stored watermark, or the epoch sentinel when absent or unreadable.
    fn read_or_epoch(&self) -> Watermark {
        match self.read() {
            Ok(Some(watermark)) => watermark,
            Ok(None) => {
                debug!("no watermark checkpoint, collecting from the beginning");
                Watermark::epoch()
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unreadable watermark checkpoint, collecting from the beginning");
                Watermark::epoch()
            }
        }
    }
}

/// Watermark persisted as the whole content of a single file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
    naive_offset: FixedOffset,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            naive_offset: Utc.fix(),
        }
    }

    /// Offset for legacy checkpoints without one, matching the API's naive timestamps.
    pub fn with_naive_offset(mut self, naive_offset: FixedOffset) -> Self {
        self.naive_offset = naive_offset;
        self
    }

    pub fn for_kind(state_dir: impl AsRef<Path>, kind: RecordKind) -> Self {
        Self::new(
            state_dir
                .as_ref()
                .join(format!("last_harvest_of_{}.txt", kind.as_str())),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn read(&self) -> Result<Option<Watermark>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        Watermark::parse_checkpoint(text, self.naive_offset)
            .map(Some)
            .with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write(&self, watermark: Watermark) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        let temp_path = parent.join(format!(".watermark.{}.tmp", Uuid::new_v4()));
        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("creating {}", temp_path.display()))?;
            file.write_all(watermark.to_checkpoint().as_bytes())
                .with_context(|| format!("writing {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing {}", temp_path.display()))?;
            fs::rename(&temp_path, &self.path).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn absent_checkpoint_reads_as_none_and_epoch() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::for_kind(dir.path(), RecordKind::Comments);
        assert_eq!(store.read().unwrap(), None);
        assert_eq!(store.read_or_epoch(), Watermark::epoch());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::for_kind(dir.path().join("state"), RecordKind::Signers);
        let wm = Watermark::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).single().unwrap());
        store.write(wm).unwrap();

        assert_eq!(store.read().unwrap(), Some(wm));
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "2024-06-01T12:30:00Z"
        );
        assert_eq!(fs::read_dir(dir.path().join("state")).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_checkpoint_falls_back_to_epoch() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("wm.txt"));
        fs::write(store.path(), "not a date").unwrap();
        assert!(store.read().is_err());
        assert_eq!(store.read_or_epoch(), Watermark::epoch());
    }

    #[test]
    fn legacy_naive_checkpoint_follows_the_naive_offset() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("wm.txt"))
            .with_naive_offset(FixedOffset::east_opt(5 * 3600).unwrap());
        fs::write(store.path(), "2023-11-05T09:15:00\n").unwrap();
        assert_eq!(
            store.read().unwrap().unwrap().instant,
            Utc.with_ymd_and_hms(2023, 11, 5, 4, 15, 0).single().unwrap()
        );

        store.write(Watermark::new(Utc.with_ymd_and_hms(2023, 11, 6, 0, 0, 0).single().unwrap())).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "2023-11-06T00:00:00Z");
    }

    #[test]
    fn legacy_naive_checkpoint_is_accepted() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("wm.txt"));
        fs::write(store.path(), "2023-11-05T09:15:00\n").unwrap();
        assert_eq!(
            store.read().unwrap().unwrap().instant,
            Utc.with_ymd_and_hms(2023, 11, 5, 9, 15, 0).single().unwrap()
        );
    }
}
