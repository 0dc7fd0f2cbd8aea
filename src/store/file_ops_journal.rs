//! Durable journal for sample file moves.
//!
//! A reassign copies the image into the new label directory before the record
//! points at it. The journal entry is written first and removed in the same
//! transaction that updates the record, so a crash in between leaves an entry
//! that reconciliation can roll forward or back.

use std::path::{Path, PathBuf};

use rusqlite::params;
use uuid::Uuid;

use super::util::{
    map_sql_error, normalize_relative_path, now_epoch_seconds, parse_relative_path_from_db,
};
use super::{FeedbackDatabase, FeedbackWriteBatch, LabelId, SampleId, StoreError};

const PENDING_MARKER: &str = ".refeed_pending_";

/// Persistent stages of a journaled move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpStage {
    /// Intent recorded before any filesystem mutation.
    Intent,
    /// Staging copy complete and the destination may already be linked;
    /// record not yet updated.
    Staged,
}

impl FileOpStage {
    fn as_str(self) -> &'static str {
        match self {
            FileOpStage::Intent => "intent",
            FileOpStage::Staged => "staged",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "intent" => Some(FileOpStage::Intent),
            "staged" => Some(FileOpStage::Staged),
            _ => None,
        }
    }
}

/// One pending move of a sample's image between label directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpJournalEntry {
    pub id: String,
    pub sample_id: SampleId,
    pub from_path: PathBuf,
    pub to_path: PathBuf,
    pub to_label_id: LabelId,
    pub stage: FileOpStage,
    pub created_at: i64,
}

impl FileOpJournalEntry {
    pub fn new_move(
        sample_id: SampleId,
        from_path: PathBuf,
        to_path: PathBuf,
        to_label_id: LabelId,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sample_id,
            from_path,
            to_path,
            to_label_id,
            stage: FileOpStage::Intent,
            created_at: now_epoch_seconds(),
        }
    }

    /// Staging path beside the destination, unique to this entry.
    pub fn staged_path(&self) -> Result<PathBuf, StoreError> {
        staged_relative_for_target(&self.to_path, &self.id)
    }
}

/// Build a staging filename next to `target_relative`.
pub fn staged_relative_for_target(
    target_relative: &Path,
    op_id: &str,
) -> Result<PathBuf, StoreError> {
    let file_name = target_relative
        .file_name()
        .ok_or_else(|| StoreError::InvalidRelativePath(target_relative.to_path_buf()))?;
    let staged_name = format!("{}{PENDING_MARKER}{op_id}", file_name.to_string_lossy());
    Ok(target_relative.with_file_name(staged_name))
}

/// True for filenames produced by [`staged_relative_for_target`].
pub fn is_pending_file_name(name: &str) -> bool {
    name.contains(PENDING_MARKER)
}

impl FeedbackDatabase {
    /// Record a move before touching the filesystem.
    pub fn insert_journal_entry(&self, entry: &FileOpJournalEntry) -> Result<(), StoreError> {
        let from = normalize_relative_path(&entry.from_path)?;
        let to = normalize_relative_path(&entry.to_path)?;
        self.connection
            .execute(
                "INSERT INTO file_ops_journal
                    (id, sample_id, from_path, to_path, to_label_id, stage, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.sample_id,
                    from,
                    to,
                    entry.to_label_id,
                    entry.stage.as_str(),
                    entry.created_at,
                ],
            )
            .map_err(map_sql_error)?;
        Ok(())
    }

    pub fn update_journal_stage(&self, id: &str, stage: FileOpStage) -> Result<(), StoreError> {
        self.connection
            .execute(
                "UPDATE file_ops_journal SET stage = ?1 WHERE id = ?2",
                params![stage.as_str(), id],
            )
            .map_err(map_sql_error)?;
        Ok(())
    }

    pub fn remove_journal_entry(&self, id: &str) -> Result<(), StoreError> {
        self.connection
            .execute("DELETE FROM file_ops_journal WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        Ok(())
    }

    /// All pending entries, oldest first. Unparseable rows are skipped with a warning.
    pub fn list_journal_entries(&self) -> Result<Vec<FileOpJournalEntry>, StoreError> {
        let mut stmt = self
            .connection
            .prepare(
                "SELECT id, sample_id, from_path, to_path, to_label_id, stage, created_at
                 FROM file_ops_journal ORDER BY created_at ASC, id ASC",
            )
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let stage_raw: String = row.get(5)?;
                let Some(stage) = FileOpStage::from_str(&stage_raw) else {
                    tracing::warn!("Skipping journal entry {id} with unknown stage {stage_raw:?}");
                    return Ok(None);
                };
                let from_raw: String = row.get(2)?;
                let to_raw: String = row.get(3)?;
                let paths = parse_relative_path_from_db(&from_raw)
                    .and_then(|from| Ok((from, parse_relative_path_from_db(&to_raw)?)));
                let (from_path, to_path) = match paths {
                    Ok(paths) => paths,
                    Err(err) => {
                        tracing::warn!("Skipping journal entry {id} with invalid path: {err}");
                        return Ok(None);
                    }
                };
                Ok(Some(FileOpJournalEntry {
                    id,
                    sample_id: row.get(1)?,
                    from_path,
                    to_path,
                    to_label_id: row.get(4)?,
                    stage,
                    created_at: row.get(6)?,
                }))
            })
            .map_err(map_sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sql_error)?;
        Ok(rows.into_iter().flatten().collect())
    }
}

impl FeedbackWriteBatch<'_> {
    /// Drop a journal entry as part of the transaction that resolves it.
    pub fn remove_journal_entry(&mut self, id: &str) -> Result<(), StoreError> {
        self.tx
            .execute("DELETE FROM file_ops_journal WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn staged_path_lives_beside_target() {
        let staged =
            staged_relative_for_target(Path::new("steak/abc.png"), "op1").unwrap();
        assert_eq!(staged, PathBuf::from("steak/abc.png.refeed_pending_op1"));
        assert!(is_pending_file_name(
            staged.file_name().unwrap().to_str().unwrap()
        ));
        assert!(!is_pending_file_name("abc.png"));
    }

    #[test]
    fn journal_entries_round_trip_and_advance() {
        let dir = tempdir().unwrap();
        let db = FeedbackDatabase::open(dir.path().join("refeed.db")).unwrap();
        let entry = FileOpJournalEntry::new_move(
            7,
            PathBuf::from("pizza/a.png"),
            PathBuf::from("steak/a.png"),
            2,
        );
        db.insert_journal_entry(&entry).unwrap();
        db.update_journal_stage(&entry.id, FileOpStage::Staged).unwrap();
        let entries = db.list_journal_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, FileOpStage::Staged);
        assert_eq!(entries[0].to_path, PathBuf::from("steak/a.png"));

        let mut batch = db.write_batch().unwrap();
        batch.remove_journal_entry(&entry.id).unwrap();
        batch.commit().unwrap();
        assert!(db.list_journal_entries().unwrap().is_empty());
    }
}
