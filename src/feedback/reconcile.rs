use std::path::Path;

use crate::store::FeedbackDatabase;
use crate::store::file_ops_journal::{FileOpJournalEntry, FileOpStage};

use super::FeedbackError;
use super::files::remove_best_effort;

/// Summary of reconciliation work performed for pending moves.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub total: usize,
    /// Record already pointed at the destination; leftover source removed.
    pub rolled_forward: usize,
    /// Record never moved; staging file removed, plus the destination when
    /// the move had reached `Staged`.
    pub rolled_back: usize,
    pub errors: Vec<String>,
}

pub(super) fn reconcile_pending_moves(
    db: &FeedbackDatabase,
    media_root: &Path,
) -> Result<ReconcileSummary, FeedbackError> {
    let entries = db.list_journal_entries()?;
    let mut summary = ReconcileSummary {
        total: entries.len(),
        ..ReconcileSummary::default()
    };
    for entry in entries {
        match reconcile_entry(db, media_root, &entry) {
            Ok(true) => summary.rolled_forward += 1,
            Ok(false) => summary.rolled_back += 1,
            Err(err) => {
                tracing::warn!("Failed to reconcile journal entry {}: {err}", entry.id);
                summary.errors.push(format!("{}: {err}", entry.id));
                continue;
            }
        }
        if let Err(err) = db.remove_journal_entry(&entry.id) {
            summary
                .errors
                .push(format!("Failed to remove journal entry {}: {err}", entry.id));
        }
    }
    Ok(summary)
}

/// Returns `true` when the move had committed and was rolled forward.
///
/// An `Intent` entry never reached the destination, so only its staging file
/// is cleaned; whatever sits at `to_path` belongs to someone else.
fn reconcile_entry(
    db: &FeedbackDatabase,
    media_root: &Path,
    entry: &FileOpJournalEntry,
) -> Result<bool, FeedbackError> {
    let staged = media_root.join(entry.staged_path()?);
    if staged.exists() {
        remove_best_effort(&staged);
    }
    let committed = db
        .sample_by_id(entry.sample_id)?
        .is_some_and(|sample| sample.image_path == entry.to_path);
    let leftover = match (committed, entry.stage) {
        (true, _) => Some(media_root.join(&entry.from_path)),
        (false, FileOpStage::Staged) => Some(media_root.join(&entry.to_path)),
        (false, FileOpStage::Intent) => None,
    };
    if let Some(leftover) = leftover
        && leftover.exists()
        && entry.from_path != entry.to_path
    {
        remove_best_effort(&leftover);
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackStore, LabelTarget};
    use crate::store::{Correctness, LabelRef};
    use std::fs;
    use tempfile::tempdir;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn store_with_sample() -> (tempfile::TempDir, FeedbackStore, crate::store::FeedbackSample) {
        let dir = tempdir().unwrap();
        let store =
            FeedbackStore::open(dir.path().join("refeed.db"), dir.path().join("media")).unwrap();
        store.create_label("pizza").unwrap();
        store.create_label("steak").unwrap();
        let sample = store
            .submit(
                &png_bytes(),
                &LabelTarget::Existing(LabelRef::from("pizza")),
                Correctness::Unknown,
            )
            .unwrap();
        (dir, store, sample)
    }

    #[test]
    fn uncommitted_move_is_rolled_back() {
        let (_dir, store, sample) = store_with_sample();
        let db = store.connect().unwrap();
        let steak = db.label_by_name("steak").unwrap().unwrap();
        let to = Path::new("steak").join(sample.image_path.file_name().unwrap());
        let entry =
            FileOpJournalEntry::new_move(sample.id, sample.image_path.clone(), to.clone(), steak.id);
        db.insert_journal_entry(&entry).unwrap();
        db.update_journal_stage(&entry.id, FileOpStage::Staged).unwrap();
        // Simulate a crash after the copy landed but before the record commit.
        fs::create_dir_all(store.media_root().join("steak")).unwrap();
        fs::copy(store.absolute_path(&sample), store.media_root().join(&to)).unwrap();

        let summary = store.reconcile().unwrap();
        assert_eq!(summary.rolled_back, 1);
        assert!(!store.media_root().join(&to).exists());
        assert!(store.absolute_path(&sample).is_file());
        assert!(db.list_journal_entries().unwrap().is_empty());
    }

    #[test]
    fn intent_only_move_keeps_destination_and_drops_partial_copy() {
        let (_dir, store, sample) = store_with_sample();
        let db = store.connect().unwrap();
        let steak = db.label_by_name("steak").unwrap().unwrap();
        let to = Path::new("steak").join(sample.image_path.file_name().unwrap());
        let entry =
            FileOpJournalEntry::new_move(sample.id, sample.image_path.clone(), to.clone(), steak.id);
        db.insert_journal_entry(&entry).unwrap();
        // Crash mid-copy: a partial staging file exists, and an unrelated
        // file already occupies the destination name.
        fs::create_dir_all(store.media_root().join("steak")).unwrap();
        let staged = store.media_root().join(entry.staged_path().unwrap());
        fs::write(&staged, b"partial").unwrap();
        fs::write(store.media_root().join(&to), b"not ours").unwrap();

        let summary = store.reconcile().unwrap();
        assert_eq!(summary.rolled_back, 1);
        assert!(!staged.exists());
        assert_eq!(fs::read(store.media_root().join(&to)).unwrap(), b"not ours");
        assert!(store.absolute_path(&sample).is_file());
        assert!(db.list_journal_entries().unwrap().is_empty());
    }

    #[test]
    fn committed_move_is_rolled_forward() {
        let (_dir, store, sample) = store_with_sample();
        let db = store.connect().unwrap();
        let steak = db.label_by_name("steak").unwrap().unwrap();
        let to = Path::new("steak").join(sample.image_path.file_name().unwrap());
        let entry =
            FileOpJournalEntry::new_move(sample.id, sample.image_path.clone(), to.clone(), steak.id);
        db.insert_journal_entry(&entry).unwrap();
        fs::create_dir_all(store.media_root().join("steak")).unwrap();
        fs::copy(store.absolute_path(&sample), store.media_root().join(&to)).unwrap();
        let mut batch = db.write_batch().unwrap();
        batch
            .update_sample_location(sample.id, &sample.image_path, steak.id, &to)
            .unwrap();
        batch.commit().unwrap();

        let summary = store.reconcile().unwrap();
        assert_eq!(summary.rolled_forward, 1);
        assert!(store.media_root().join(&to).is_file());
        assert!(!store.absolute_path(&sample).exists());
    }
}
