//! Feedback Store: sample records plus the image files backing them.
//!
//! Every sample owns exactly one file at `<media root>/<label name>/<token>.<ext>`.
//! Files are written before the record commits and cleaned up if the commit
//! fails; record deletion is authoritative and file removal is best effort.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::store::file_ops_journal::{FileOpJournalEntry, FileOpStage};
use crate::store::samples::NewSample;
use crate::store::{
    Correctness, FeedbackDatabase, FeedbackPage, FeedbackSample, Label, LabelId, LabelRef,
    LabelSummary, Page, SampleId, StoreError, validate_label_name,
};

mod files;
mod reconcile;

pub use reconcile::ReconcileSummary;

/// Errors returned by the Feedback Store.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// No image bytes were supplied.
    #[error("Image is missing or empty")]
    EmptyImage,
    /// Bytes are not in a recognised image format.
    #[error("Image format not recognised")]
    UnrecognizedImage,
    /// Filesystem work for a sample failed.
    #[error("File operation failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FeedbackError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        FeedbackError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which label a submission is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTarget {
    /// Must already exist.
    Existing(LabelRef),
    /// Created in the same transaction as the sample when missing.
    GetOrCreate(String),
}

/// What a sample delete actually removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub record_removed: bool,
    pub file_removed: bool,
}

/// Result of deleting a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDeletion {
    pub label: Label,
    pub samples_removed: usize,
    pub files_removed: usize,
}

/// Owns the database location and the media root.
///
/// Each operation opens its own connection, so the store is cheap to share
/// between request workers.
#[derive(Debug, Clone)]
pub struct FeedbackStore {
    db_path: PathBuf,
    media_root: PathBuf,
}

impl FeedbackStore {
    /// Open the store, applying the schema and reconciling interrupted moves.
    pub fn open(
        db_path: impl Into<PathBuf>,
        media_root: impl Into<PathBuf>,
    ) -> Result<Self, FeedbackError> {
        let store = Self {
            db_path: db_path.into(),
            media_root: media_root.into(),
        };
        std::fs::create_dir_all(&store.media_root)
            .map_err(|err| FeedbackError::io(&store.media_root, err))?;
        let db = FeedbackDatabase::open(&store.db_path)?;
        let summary = reconcile::reconcile_pending_moves(&db, &store.media_root)?;
        if summary.total > 0 {
            tracing::info!(
                "Reconciled {} pending file moves ({} rolled forward, {} rolled back, {} errors)",
                summary.total,
                summary.rolled_forward,
                summary.rolled_back,
                summary.errors.len()
            );
        }
        Ok(store)
    }

    /// Fresh connection for one operation.
    pub fn connect(&self) -> Result<FeedbackDatabase, FeedbackError> {
        Ok(FeedbackDatabase::connect(&self.db_path)?)
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Absolute location of a sample's image.
    pub fn absolute_path(&self, sample: &FeedbackSample) -> PathBuf {
        self.media_root.join(&sample.image_path)
    }

    /// Re-run journal reconciliation.
    pub fn reconcile(&self) -> Result<ReconcileSummary, FeedbackError> {
        let db = self.connect()?;
        reconcile::reconcile_pending_moves(&db, &self.media_root)
    }

    pub fn create_label(&self, name: &str) -> Result<Label, FeedbackError> {
        let label = self.connect()?.create_label(name)?;
        tracing::info!("Created label {:?} (id {})", label.name, label.id);
        Ok(label)
    }

    pub fn list_labels(&self) -> Result<Vec<LabelSummary>, FeedbackError> {
        Ok(self.connect()?.list_label_summaries()?)
    }

    pub fn label_names(&self) -> Result<Vec<String>, FeedbackError> {
        Ok(self.connect()?.label_names()?)
    }

    pub fn resolve_label(&self, label: &LabelRef) -> Result<Label, FeedbackError> {
        Ok(self.connect()?.resolve_label(label)?)
    }

    /// Delete a label. With `cascade`, its samples and their files go too.
    pub fn delete_label(
        &self,
        label: &LabelRef,
        cascade: bool,
    ) -> Result<LabelDeletion, FeedbackError> {
        let db = self.connect()?;
        let label = db.resolve_label(label)?;
        let mut batch = db.write_batch()?;
        let doomed = if cascade {
            batch.samples_for_label(label.id)?
        } else {
            Vec::new()
        };
        for sample in &doomed {
            batch.delete_sample(sample.id)?;
        }
        let label = batch.delete_label(label.id)?;
        batch.commit()?;

        let files_removed = doomed
            .iter()
            .filter(|sample| files::remove_best_effort(&self.absolute_path(sample)))
            .count();
        let dir = self.media_root.join(&label.name);
        if let Err(err) = crate::fs_ops::remove_dir_if_empty(&dir) {
            tracing::warn!("Failed to remove label directory {}: {err}", dir.display());
        }
        tracing::info!(
            "Deleted label {:?} with {} samples",
            label.name,
            doomed.len()
        );
        Ok(LabelDeletion {
            label,
            samples_removed: doomed.len(),
            files_removed,
        })
    }

    /// Store `image` under the target label.
    ///
    /// The file lands first; if the record cannot be committed the file is
    /// removed again before the error is returned.
    pub fn submit(
        &self,
        image: &[u8],
        target: &LabelTarget,
        correctness: Correctness,
    ) -> Result<FeedbackSample, FeedbackError> {
        let extension = files::image_extension(image)?;
        let db = self.connect()?;
        let dir_name = match target {
            LabelTarget::Existing(label) => db.resolve_label(label)?.name,
            LabelTarget::GetOrCreate(name) => validate_label_name(name)?,
        };
        let token = Uuid::new_v4();
        let relative = PathBuf::from(&dir_name).join(format!("{token}.{extension}"));
        let staged = files::write_new_file(&self.media_root.join(&relative), image)?;

        let mut batch = db.write_batch()?;
        let label = match target {
            LabelTarget::Existing(label) => {
                let found = match label {
                    LabelRef::Id(id) => batch.label_by_id(*id)?,
                    LabelRef::Name(_) => batch.label_by_name(&dir_name)?,
                };
                found
                    .filter(|found| found.name == dir_name)
                    .ok_or_else(|| StoreError::LabelNotFound(label.clone()))?
            }
            LabelTarget::GetOrCreate(_) => {
                let (label, created) = batch.get_or_create_label(&dir_name)?;
                if created {
                    tracing::info!("Created label {:?} from feedback", label.name);
                }
                label
            }
        };
        let created_at = crate::store::util::now_epoch_seconds();
        let id = batch.insert_sample(&NewSample {
            label_id: label.id,
            image_path: &relative,
            correctness,
            token,
            created_at,
        })?;
        batch.commit()?;
        staged.disarm();
        tracing::debug!("Stored feedback sample {id} at {}", relative.display());
        Ok(FeedbackSample {
            id,
            label,
            image_path: relative,
            created_at,
            correctness,
            token,
        })
    }

    /// Move a sample to another label, relocating its file.
    ///
    /// The new file is in place before the record flips; the old file is
    /// removed only after the record commit. The record update only applies
    /// if nobody moved the sample since it was read; a move that lost that
    /// race fails with `StaleSample` and removes its own copy.
    pub fn reassign(
        &self,
        sample: SampleId,
        new_label: &LabelRef,
    ) -> Result<FeedbackSample, FeedbackError> {
        let db = self.connect()?;
        let current = db
            .sample_by_id(sample)?
            .ok_or(StoreError::SampleNotFound(sample))?;
        let target = db.resolve_label(new_label)?;
        if target.id == current.label.id {
            return Ok(current);
        }
        let file_name = current
            .image_path
            .file_name()
            .ok_or_else(|| StoreError::InvalidRelativePath(current.image_path.clone()))?;
        let to_relative = PathBuf::from(&target.name).join(file_name);
        let from_absolute = self.absolute_path(&current);
        let to_absolute = self.media_root.join(&to_relative);

        let entry = FileOpJournalEntry::new_move(
            current.id,
            current.image_path.clone(),
            to_relative.clone(),
            target.id,
        );
        db.insert_journal_entry(&entry)?;
        let moved = if from_absolute.is_file() {
            match self.stage_and_install(&db, &entry, &from_absolute, &to_absolute) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    self.abandon_journal_entry(&db, &entry);
                    return Err(err);
                }
            }
        } else {
            tracing::warn!(
                "Reassigning sample {} whose image is missing: {}",
                current.id,
                from_absolute.display()
            );
            None
        };

        let committed = db.write_batch().and_then(|mut batch| {
            batch.update_sample_location(
                current.id,
                &current.image_path,
                target.id,
                &to_relative,
            )?;
            batch.remove_journal_entry(&entry.id)?;
            batch.commit()
        });
        if let Err(err) = committed {
            drop(moved);
            self.abandon_journal_entry(&db, &entry);
            if matches!(err, StoreError::StaleSample(_)) {
                tracing::info!("Sample {} moved concurrently; move discarded", current.id);
            }
            return Err(err.into());
        }
        if let Some(guard) = moved {
            guard.disarm();
            files::remove_best_effort(&from_absolute);
        }
        tracing::info!(
            "Moved sample {} from {:?} to {:?}",
            current.id,
            current.label.name,
            target.name
        );
        Ok(FeedbackSample {
            label: target,
            image_path: to_relative,
            ..current
        })
    }

    /// Remove a sample record and its file.
    ///
    /// Calling this again for the same id is a no-op that still succeeds.
    pub fn delete(&self, sample: SampleId) -> Result<DeleteOutcome, FeedbackError> {
        let db = self.connect()?;
        let Some(existing) = db.sample_by_id(sample)? else {
            tracing::debug!("Delete of unknown sample {sample} ignored");
            return Ok(DeleteOutcome::default());
        };
        let mut batch = db.write_batch()?;
        let record_removed = batch.delete_sample(existing.id)?;
        batch.commit()?;
        let file_removed = record_removed && files::remove_best_effort(&self.absolute_path(&existing));
        Ok(DeleteOutcome {
            record_removed,
            file_removed,
        })
    }

    pub fn sample(&self, id: SampleId) -> Result<FeedbackSample, FeedbackError> {
        Ok(self
            .connect()?
            .sample_by_id(id)?
            .ok_or(StoreError::SampleNotFound(id))?)
    }

    pub fn sample_by_token(&self, token: &Uuid) -> Result<Option<FeedbackSample>, FeedbackError> {
        Ok(self.connect()?.sample_by_token(token)?)
    }

    /// Newest-first feedback, optionally for one label.
    pub fn list(
        &self,
        page: Page,
        label: Option<&LabelRef>,
    ) -> Result<FeedbackPage, FeedbackError> {
        let db = self.connect()?;
        let label_id: Option<LabelId> = match label {
            Some(label) => Some(db.resolve_label(label)?.id),
            None => None,
        };
        Ok(db.list_samples(page, label_id)?)
    }

    /// Copy the source under the entry's staging name, mark the entry
    /// `Staged`, then link the copy into its final place.
    fn stage_and_install(
        &self,
        db: &FeedbackDatabase,
        entry: &FileOpJournalEntry,
        from: &Path,
        to: &Path,
    ) -> Result<files::StagedFile, FeedbackError> {
        let staged = files::stage_copy(from, &self.media_root.join(entry.staged_path()?))?;
        db.update_journal_stage(&entry.id, FileOpStage::Staged)?;
        files::install_staged(staged, to)
    }

    fn abandon_journal_entry(&self, db: &FeedbackDatabase, entry: &FileOpJournalEntry) {
        if let Err(err) = db.remove_journal_entry(&entry.id) {
            tracing::warn!(
                "Failed to drop journal entry {}; it will be reconciled on next open: {err}",
                entry.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn png_bytes(shade: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([shade, shade, shade]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn open() -> (tempfile::TempDir, FeedbackStore) {
        let dir = tempdir().unwrap();
        let store =
            FeedbackStore::open(dir.path().join("refeed.db"), dir.path().join("media")).unwrap();
        (dir, store)
    }

    #[test]
    fn submit_writes_file_under_label_directory() {
        let (_dir, store) = open();
        store.create_label("pizza").unwrap();
        let sample = store
            .submit(
                &png_bytes(1),
                &LabelTarget::Existing(LabelRef::from("pizza")),
                Correctness::Unknown,
            )
            .unwrap();
        assert!(sample.image_path.starts_with("pizza"));
        assert_eq!(
            sample.image_path.extension().and_then(|ext| ext.to_str()),
            Some("png")
        );
        assert!(store.absolute_path(&sample).is_file());
    }

    #[test]
    fn submit_to_missing_label_leaves_no_file() {
        let (_dir, store) = open();
        let err = store
            .submit(
                &png_bytes(1),
                &LabelTarget::Existing(LabelRef::Id(42)),
                Correctness::Incorrect,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FeedbackError::Store(StoreError::LabelNotFound(_))
        ));
        assert_eq!(fs::read_dir(store.media_root()).unwrap().count(), 0);
    }

    #[test]
    fn get_or_create_submission_creates_label() {
        let (_dir, store) = open();
        let sample = store
            .submit(
                &png_bytes(1),
                &LabelTarget::GetOrCreate("sushi".to_string()),
                Correctness::Correct,
            )
            .unwrap();
        assert_eq!(sample.label.name, "sushi");
        assert_eq!(store.label_names().unwrap(), vec!["sushi"]);
    }

    #[test]
    fn reassign_moves_file_and_record() {
        let (_dir, store) = open();
        store.create_label("pizza").unwrap();
        let steak = store.create_label("steak").unwrap();
        let sample = store
            .submit(
                &png_bytes(1),
                &LabelTarget::Existing(LabelRef::from("pizza")),
                Correctness::Incorrect,
            )
            .unwrap();
        let old_path = store.absolute_path(&sample);
        let moved = store.reassign(sample.id, &LabelRef::Id(steak.id)).unwrap();
        assert_eq!(moved.label, steak);
        assert!(!old_path.exists());
        assert!(store.absolute_path(&moved).is_file());
        assert_eq!(store.sample(sample.id).unwrap().image_path, moved.image_path);
        assert!(store.connect().unwrap().list_journal_entries().unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = open();
        store.create_label("pizza").unwrap();
        let sample = store
            .submit(
                &png_bytes(1),
                &LabelTarget::Existing(LabelRef::from("pizza")),
                Correctness::Unknown,
            )
            .unwrap();
        let first = store.delete(sample.id).unwrap();
        assert_eq!(
            first,
            DeleteOutcome {
                record_removed: true,
                file_removed: true
            }
        );
        assert_eq!(store.delete(sample.id).unwrap(), DeleteOutcome::default());
    }

    #[test]
    fn delete_tolerates_missing_file() {
        let (_dir, store) = open();
        store.create_label("pizza").unwrap();
        let sample = store
            .submit(
                &png_bytes(1),
                &LabelTarget::Existing(LabelRef::from("pizza")),
                Correctness::Unknown,
            )
            .unwrap();
        fs::remove_file(store.absolute_path(&sample)).unwrap();
        let outcome = store.delete(sample.id).unwrap();
        assert!(outcome.record_removed);
        assert!(!outcome.file_removed);
    }

    #[test]
    fn cascade_delete_removes_samples_and_directory() {
        let (_dir, store) = open();
        store.create_label("pizza").unwrap();
        for shade in 0..3 {
            store
                .submit(
                    &png_bytes(shade),
                    &LabelTarget::Existing(LabelRef::from("pizza")),
                    Correctness::Unknown,
                )
                .unwrap();
        }
        let err = store.delete_label(&LabelRef::from("pizza"), false).unwrap_err();
        assert!(matches!(
            err,
            FeedbackError::Store(StoreError::LabelInUse { samples: 3, .. })
        ));
        let deletion = store.delete_label(&LabelRef::from("pizza"), true).unwrap();
        assert_eq!(deletion.samples_removed, 3);
        assert_eq!(deletion.files_removed, 3);
        assert!(!store.media_root().join("pizza").exists());
        assert!(store.label_names().unwrap().is_empty());
    }
}
