//! Filesystem-backed queue of undelivered artifacts.
//!
//! Each entry is one JSON record at `{root}/{kind}/{YYYYMMDDTHHMMZ}.json`.
//! The file name is the `(kind, captured_at)` key, so oldest-first order is
//! computed from directory listings alone. Writes go through a temp file that
//! is fsynced and renamed into place, so a crash never leaves a partial record
//! under a valid name.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactKind};

/// Layout of the timestamp part of a record file name.
const KEY_FORMAT: &str = "%Y%m%dT%H%MZ";

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Records that cannot be decoded are moved here.
const CORRUPT_DIR: &str = "corrupt";

/// Identity of a queue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub kind: ArtifactKind,
    pub captured_at: DateTime<Utc>,
}

impl QueueKey {
    pub fn new(kind: ArtifactKind, captured_at: DateTime<Utc>) -> Self {
        Self { kind, captured_at }
    }

    pub fn of(artifact: &Artifact) -> Self {
        Self::new(artifact.kind(), artifact.captured_at())
    }

    fn file_stem(&self) -> String {
        self.captured_at.format(KEY_FORMAT).to_string()
    }

    fn file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), RECORD_EXTENSION)
    }

    /// Recover a key from a record file name. Anything else in the directory
    /// (temp files, stray files) yields `None`.
    fn parse(kind: ArtifactKind, file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", RECORD_EXTENSION))?;
        let naive = NaiveDateTime::parse_from_str(stem, KEY_FORMAT).ok()?;
        Some(Self::new(kind, naive.and_utc()))
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug)]
pub enum QueueError {
    /// Filesystem operation failed
    Io { path: PathBuf, source: io::Error },

    /// Record could not be serialized
    Encode(serde_json::Error),
}

impl QueueError {
    fn io(path: &Path, source: io::Error) -> Self {
        QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Io { path, source } => {
                write!(f, "Queue I/O error at {}: {}", path.display(), source)
            }
            QueueError::Encode(e) => write!(f, "Failed to encode queue record: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Io { source, .. } => Some(source),
            QueueError::Encode(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Encode(err)
    }
}

/// Durable store-and-forward queue.
///
/// Different kinds live in different directories and never interfere. For a
/// single kind, an enqueue racing a drain pass is either seen by that pass or
/// left for the next one.
#[derive(Debug)]
pub struct DurableQueue {
    root: PathBuf,
}

impl DurableQueue {
    /// Open (and create if needed) a queue rooted at `root`.
    ///
    /// Leftover temp files from an interrupted write are deleted.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let queue = Self { root: root.into() };

        for kind in ArtifactKind::all() {
            let dir = queue.kind_dir(*kind);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| QueueError::io(&dir, e))?;
            queue.remove_stale_temp_files(&dir).await?;
        }

        info!(root = %queue.root.display(), "Durable queue opened");
        Ok(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist an artifact, replacing any record with the same key.
    pub async fn enqueue(&self, artifact: &Artifact) -> Result<(), QueueError> {
        let key = QueueKey::of(artifact);
        let dir = self.kind_dir(key.kind);
        let final_path = dir.join(key.file_name());
        let temp_path = dir.join(format!(
            ".{}.{}.{}",
            key.file_stem(),
            Uuid::new_v4(),
            TEMP_EXTENSION
        ));

        let record = serde_json::to_vec(artifact)?;

        if let Err(e) = write_synced(&temp_path, &record).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(QueueError::io(&temp_path, e));
        }

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(QueueError::io(&final_path, e));
        }

        // The rename is only durable once the directory entry is on disk.
        sync_dir(&dir).await.map_err(|e| QueueError::io(&dir, e))?;

        debug!(
            kind = %key.kind,
            captured_at = %key.captured_at,
            bytes = record.len(),
            "Artifact queued"
        );
        Ok(())
    }

    /// Keys of all queued records of one kind, oldest first.
    pub async fn keys(&self, kind: ArtifactKind) -> Result<Vec<QueueKey>, QueueError> {
        let dir = self.kind_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::io(&dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(&dir, e))?
        {
            let file_name = entry.file_name();
            if let Some(key) = file_name.to_str().and_then(|n| QueueKey::parse(kind, n)) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Load one record.
    ///
    /// Returns `None` if the record is gone (removed concurrently) or was
    /// undecodable and has been quarantined.
    pub async fn read(&self, key: QueueKey) -> Result<Option<Artifact>, QueueError> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::io(&path, e)),
        };

        match serde_json::from_slice::<Artifact>(&bytes) {
            Ok(artifact) if QueueKey::of(&artifact) == key => Ok(Some(artifact)),
            Ok(artifact) => {
                error!(
                    kind = %key.kind,
                    captured_at = %key.captured_at,
                    record_kind = %artifact.kind(),
                    record_captured_at = %artifact.captured_at(),
                    "Queue record does not match its key, data lost"
                );
                self.quarantine(&path).await?;
                Ok(None)
            }
            Err(e) => {
                error!(
                    kind = %key.kind,
                    captured_at = %key.captured_at,
                    error = %e,
                    "Queue record is unreadable, data lost"
                );
                self.quarantine(&path).await?;
                Ok(None)
            }
        }
    }

    /// All queued artifacts of one kind, oldest first. Empty if nothing is queued.
    pub async fn list(&self, kind: ArtifactKind) -> Result<Vec<Artifact>, QueueError> {
        let mut artifacts = Vec::new();
        for key in self.keys(kind).await? {
            if let Some(artifact) = self.read(key).await? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    /// Delete a record. Removing a missing record is not an error.
    pub async fn remove(
        &self,
        kind: ArtifactKind,
        captured_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let path = self.record_path(QueueKey::new(kind, captured_at));
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(kind = %kind, captured_at = %captured_at, "Queue record removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }

    /// Number of queued records of one kind.
    pub async fn len(&self, kind: ArtifactKind) -> Result<usize, QueueError> {
        Ok(self.keys(kind).await?.len())
    }

    pub async fn is_empty(&self, kind: ArtifactKind) -> Result<bool, QueueError> {
        Ok(self.len(kind).await? == 0)
    }

    fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.name())
    }

    fn record_path(&self, key: QueueKey) -> PathBuf {
        self.kind_dir(key.kind).join(key.file_name())
    }

    async fn quarantine(&self, path: &Path) -> Result<(), QueueError> {
        let dir = self.root.join(CORRUPT_DIR);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = dir.join(format!("{}.{}", Uuid::new_v4(), file_name));

        match fs::rename(path, &target).await {
            Ok(()) => {
                warn!(from = %path.display(), to = %target.display(), "Queue record quarantined");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(path, e)),
        }
    }

    async fn remove_stale_temp_files(&self, dir: &Path) -> Result<(), QueueError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| QueueError::io(dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                warn!(path = %path.display(), "Removing partial queue record");
                fs::remove_file(&path)
                    .await
                    .map_err(|e| QueueError::io(&path, e))?;
            }
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}
