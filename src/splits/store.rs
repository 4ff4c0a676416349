//! Run Store
//!
//! On-disk layout of a category directory:
//!
//! ```text
//! <category>/best.json               - best confirmed run, replaced atomically
//! <category>/<timestamp>[-n].json    - one write-once document per submission
//! ```
//!
//! The store never creates category directories.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::codec::{decode, encode, DecodeError, GameSplit};

/// File name of the best document inside a category.
pub const BEST_FILE: &str = "best.json";

/// Timestamp layout used for run document names.
pub const RUN_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Same-second submissions to one category beyond this count are refused.
const MAX_RUN_ID_ATTEMPTS: u32 = 1000;

/// Identifier of a stored run: its timestamp plus a collision suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(String);

impl RunId {
    fn new(stamp: &str, attempt: u32) -> Self {
        if attempt == 0 {
            Self(stamp.to_string())
        } else {
            Self(format!("{}-{}", stamp, attempt))
        }
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the document holding this run.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Document does not exist.
    #[error("Document not found: {0}")]
    NotFound(PathBuf),

    /// Document exists but is not a valid run.
    #[error("Corrupt document {path}: {source}")]
    Decode {
        /// Offending file.
        path: PathBuf,
        /// Why it failed to decode.
        #[source]
        source: DecodeError,
    },

    /// Run could not be serialized.
    #[error("Failed to encode {path}: {source}")]
    Encode {
        /// Document that was being written.
        path: PathBuf,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Persist a submitted run under a fresh timestamped name.
pub async fn write_run(category: &Path, split: &GameSplit) -> Result<RunId, StoreError> {
    write_run_at(category, split, Local::now()).await
}

/// Persist a submitted run named after `at`.
///
/// Documents are created exclusively: a second run in the same second gets a
/// `-1`, `-2`, ... suffix instead of overwriting the first.
pub async fn write_run_at(
    category: &Path,
    split: &GameSplit,
    at: DateTime<Local>,
) -> Result<RunId, StoreError> {
    let stamp = at.format(RUN_ID_FORMAT).to_string();
    let bytes = encode(split).map_err(|source| StoreError::Encode {
        path: category.join(RunId::new(&stamp, 0).file_name()),
        source,
    })?;

    for attempt in 0..MAX_RUN_ID_ATTEMPTS {
        let id = RunId::new(&stamp, attempt);
        let path = category.join(id.file_name());

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let written: std::io::Result<()> = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(StoreError::io(path, e));
        }

        return Ok(id);
    }

    Err(StoreError::io(
        category.join(RunId::new(&stamp, 0).file_name()),
        std::io::Error::new(ErrorKind::AlreadyExists, "no free run id left for this second"),
    ))
}

/// Load a category's best document.
///
/// A directory squatting on the `best.json` name counts as no best document.
pub async fn read_best(category: &Path) -> Result<GameSplit, StoreError> {
    let path = category.join(BEST_FILE);
    if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(StoreError::NotFound(path));
    }
    let bytes = read_document(&path).await?;
    decode(&bytes).map_err(|source| StoreError::Decode { path, source })
}

/// Atomically replace a category's best document.
///
/// The new content goes to a temporary file in the same directory, which is
/// synced and then renamed over `best.json`.
pub async fn replace_best(category: &Path, split: &GameSplit) -> Result<(), StoreError> {
    let target = category.join(BEST_FILE);
    let temp = category.join(format!(".{}.{}.tmp", BEST_FILE, Uuid::new_v4().simple()));
    let bytes = encode(split).map_err(|source| StoreError::Encode {
        path: target.clone(),
        source,
    })?;

    let result: std::io::Result<()> = async {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &target).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp).await;
        return Err(StoreError::io(target, e));
    }

    Ok(())
}

/// Read any stored document verbatim.
pub async fn read_document(path: &Path) -> Result<Vec<u8>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.to_path_buf())),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
