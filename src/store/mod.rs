//! SQLite persistence for labels, feedback records, system info and the
//! file-move journal.
//!
//! The database is the authoritative record store. Files under the media root
//! are managed by [`crate::feedback::FeedbackStore`], which calls into this
//! module inside write batches so record changes commit atomically.

use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Label Registry queries and mutations.
pub mod labels;
/// Feedback sample record queries and mutations.
pub mod samples;
/// SQLite schema management.
pub mod schema;
/// SystemInfo singleton access.
pub mod system_info;
/// Durable journal for in-flight sample file moves.
pub mod file_ops_journal;
/// Path and error helpers.
pub mod util;

pub use util::{normalize_relative_path, validate_label_name};

/// Database row id of a label.
pub type LabelId = i64;
/// Database row id of a feedback sample.
pub type SampleId = i64;

/// A class in the Label Registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

/// Label plus the number of samples that currently reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSummary {
    pub label: Label,
    pub sample_count: u64,
}

/// How a caller refers to a label at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelRef {
    Id(LabelId),
    Name(String),
}

impl fmt::Display for LabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelRef::Id(id) => write!(f, "id {id}"),
            LabelRef::Name(name) => write!(f, "name {name:?}"),
        }
    }
}

impl From<LabelId> for LabelRef {
    fn from(id: LabelId) -> Self {
        LabelRef::Id(id)
    }
}

impl From<&str> for LabelRef {
    fn from(name: &str) -> Self {
        LabelRef::Name(name.to_string())
    }
}

/// Whether the prediction that produced a sample was right.
///
/// Stored as a nullable integer: `1` correct, `0` incorrect, `NULL` unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correctness {
    Correct,
    Incorrect,
    Unknown,
}

impl Correctness {
    /// Parse the loosely typed flag a transport receives (`"true"`, `"false"`,
    /// `"1"`, `"0"`, empty or missing).
    pub fn from_flag(flag: Option<&str>) -> Self {
        match flag.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if matches!(value.as_str(), "true" | "1" | "yes") => Correctness::Correct,
            Some(value) if matches!(value.as_str(), "false" | "0" | "no") => {
                Correctness::Incorrect
            }
            _ => Correctness::Unknown,
        }
    }

    pub fn from_bool(value: Option<bool>) -> Self {
        match value {
            Some(true) => Correctness::Correct,
            Some(false) => Correctness::Incorrect,
            None => Correctness::Unknown,
        }
    }

    pub(crate) fn as_db(self) -> Option<i64> {
        match self {
            Correctness::Correct => Some(1),
            Correctness::Incorrect => Some(0),
            Correctness::Unknown => None,
        }
    }

    pub(crate) fn from_db(value: Option<i64>) -> Self {
        Self::from_bool(value.map(|flag| flag != 0))
    }
}

/// One labeled image submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSample {
    pub id: SampleId,
    pub label: Label,
    /// Image location relative to the media root (`<label>/<file>`).
    pub image_path: PathBuf,
    /// Epoch seconds.
    pub created_at: i64,
    pub correctness: Correctness,
    pub token: Uuid,
}

/// Singleton metadata describing the currently promoted model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub accuracy: Option<f32>,
    /// Epoch seconds of the last successful promotion.
    pub last_trained_at: Option<i64>,
    pub total_samples: Option<u64>,
    pub model_id: Option<String>,
}

/// Offset/limit window over newest-first feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of feedback plus the total matching count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackPage {
    pub items: Vec<FeedbackSample>,
    pub total: u64,
}

/// Errors returned by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite query failed.
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    /// Failed to create a parent directory.
    #[error("Could not write to {path}: {source}")]
    CreateDir {
        /// Path that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// Provided path was not relative to the media root.
    #[error("Path must be relative to the media root: {0}")]
    PathMustBeRelative(PathBuf),
    /// Provided path contained disallowed components or was empty.
    #[error("Path contains invalid relative components: {0}")]
    InvalidRelativePath(PathBuf),
    /// Label name is empty or cannot be used as a directory name.
    #[error("Invalid label name: {0:?}")]
    InvalidLabelName(String),
    /// A label with this name already exists.
    #[error("Label already exists: {0}")]
    DuplicateLabel(String),
    /// No label matched the reference.
    #[error("Label not found: {0}")]
    LabelNotFound(LabelRef),
    /// Label still has samples and cascading was not requested.
    #[error("Label {name} is referenced by {samples} samples")]
    LabelInUse { name: String, samples: u64 },
    /// No sample with this id.
    #[error("Feedback sample not found: {0}")]
    SampleNotFound(SampleId),
    /// The record changed between read and write; retry with fresh state.
    #[error("Feedback sample {0} was changed concurrently")]
    StaleSample(SampleId),
    /// Database is locked or busy.
    #[error("Database is busy, please retry")]
    Busy,
    /// SQLite returned an unexpected result.
    #[error("SQLite returned an unexpected result")]
    Unexpected,
}

/// One SQLite connection to the lifecycle database.
pub struct FeedbackDatabase {
    connection: Connection,
    path: PathBuf,
}

/// Groups multiple record writes into one immediate transaction.
pub struct FeedbackWriteBatch<'conn> {
    tx: Transaction<'conn>,
}

impl FeedbackDatabase {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Self::connect(path)?;
        schema::apply_schema(&db.connection)?;
        Ok(db)
    }

    /// Open a connection to an existing database without schema work.
    ///
    /// Used for per-operation connections once [`FeedbackDatabase::open`] has
    /// run at startup.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        util::create_parent_if_needed(path)?;
        let connection = Connection::open(path)?;
        let db = Self {
            connection,
            path: path.to_path_buf(),
        };
        db.apply_pragmas()?;
        Ok(db)
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a write batch that wraps related mutations in one transaction.
    pub fn write_batch(&self) -> Result<FeedbackWriteBatch<'_>, StoreError> {
        let tx = Transaction::new_unchecked(&self.connection, TransactionBehavior::Immediate)
            .map_err(util::map_sql_error)?;
        Ok(FeedbackWriteBatch { tx })
    }

    fn apply_pragmas(&self) -> Result<(), StoreError> {
        self.connection
            .execute_batch(
                "PRAGMA busy_timeout=5000;
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA temp_store=MEMORY;",
            )
            .map_err(util::map_sql_error)
    }
}

impl FeedbackWriteBatch<'_> {
    /// Commit all writes in this batch.
    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().map_err(util::map_sql_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn correctness_flag_parsing_covers_boundary_encodings() {
        assert_eq!(Correctness::from_flag(Some("true")), Correctness::Correct);
        assert_eq!(Correctness::from_flag(Some(" TRUE ")), Correctness::Correct);
        assert_eq!(Correctness::from_flag(Some("1")), Correctness::Correct);
        assert_eq!(Correctness::from_flag(Some("false")), Correctness::Incorrect);
        assert_eq!(Correctness::from_flag(Some("0")), Correctness::Incorrect);
        assert_eq!(Correctness::from_flag(Some("")), Correctness::Unknown);
        assert_eq!(Correctness::from_flag(Some("undefined")), Correctness::Unknown);
        assert_eq!(Correctness::from_flag(None), Correctness::Unknown);
    }

    #[test]
    fn correctness_round_trips_through_nullable_column() {
        for value in [
            Correctness::Correct,
            Correctness::Incorrect,
            Correctness::Unknown,
        ] {
            assert_eq!(Correctness::from_db(value.as_db()), value);
        }
    }

    #[test]
    fn applies_workload_pragmas() {
        let dir = tempdir().unwrap();
        let db = FeedbackDatabase::open(dir.path().join("refeed.db")).unwrap();
        let journal_mode: String = db
            .connection
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
        let foreign_keys: i64 = db
            .connection
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
        let busy_timeout: i64 = db
            .connection
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 5000);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("refeed.db");
        let db = FeedbackDatabase::open(&path).unwrap();
        assert_eq!(db.path(), path.as_path());
        assert!(path.is_file());
    }
}
