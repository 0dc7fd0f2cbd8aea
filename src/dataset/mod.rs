//! Dataset Synchronizer: projects the Feedback Store into a per-job corpus.
//!
//! The Label Registry decides which classes exist and in what order. Folders
//! under the media root are matched against it by name; disagreements are
//! reported but never fatal.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

mod corpus;
mod split;

pub use corpus::{CorpusSample, collect_corpus_samples, is_eligible_file};
pub use split::{Partition, SplitPolicy, deterministic_split};

/// Errors raised while building or reading a corpus.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Corpus root is missing.
    #[error("Corpus root not found: {0}")]
    CorpusNotFound(PathBuf),
    /// Filesystem work failed.
    #[error("Corpus IO failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SyncError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Differences between registry names and media folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MismatchReport {
    /// Registry labels without a folder; they train with zero examples.
    pub missing_folders: Vec<String>,
    /// Folders with no registry label; copied into the corpus but never bound
    /// to an output class.
    pub extra_folders: Vec<String>,
    /// Eligible files found in extra folders.
    pub unmapped_files: usize,
}

impl MismatchReport {
    pub fn is_empty(&self) -> bool {
        self.missing_folders.is_empty() && self.extra_folders.is_empty()
    }
}

/// A materialized corpus ready for training.
#[derive(Debug, Clone)]
pub struct SyncedCorpus {
    pub root: PathBuf,
    /// Sorted registry names; index `i` is model output `i`.
    pub classes: Vec<String>,
    pub report: MismatchReport,
    /// Files placed into registry class directories.
    pub files: usize,
}

/// Builds corpora from the media root into a work directory.
#[derive(Debug, Clone)]
pub struct DatasetSynchronizer {
    media_root: PathBuf,
    work_dir: PathBuf,
}

impl DatasetSynchronizer {
    pub fn new(media_root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Snapshot the media root into `<work dir>/<job id>` using `registry_names`
    /// as the authoritative class list.
    ///
    /// Every registry class gets a directory, even when it has no images.
    pub fn synchronize(
        &self,
        registry_names: &[String],
        job_id: &str,
    ) -> Result<SyncedCorpus, SyncError> {
        let classes: Vec<String> = registry_names
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let folders = self.folder_names()?;
        let report = mismatch_report(&classes, &folders, &self.media_root)?;
        if !report.is_empty() {
            tracing::warn!(
                "Label registry and media folders disagree: missing folders {:?}, extra folders {:?} ({} files not bound to a class)",
                report.missing_folders,
                report.extra_folders,
                report.unmapped_files
            );
        }

        let root = self.work_dir.join(job_id);
        if root.exists() {
            fs::remove_dir_all(&root).map_err(|err| SyncError::io(&root, err))?;
        }
        let mut files = 0usize;
        for class in &classes {
            files += self.place_folder(class, &root)?;
        }
        for extra in &report.extra_folders {
            self.place_folder(extra, &root)?;
        }
        tracing::info!(
            "Synchronized corpus {} with {} classes and {} files",
            root.display(),
            classes.len(),
            files
        );
        Ok(SyncedCorpus {
            root,
            classes,
            report,
            files,
        })
    }

    /// Create `root/<folder>` and fill it from the media folder of the same
    /// name. Returns the number of files placed.
    fn place_folder(&self, folder: &str, root: &Path) -> Result<usize, SyncError> {
        let target_dir = root.join(folder);
        fs::create_dir_all(&target_dir).map_err(|err| SyncError::io(&target_dir, err))?;
        let source_dir = self.media_root.join(folder);
        if !source_dir.is_dir() {
            return Ok(0);
        }
        let mut placed = 0usize;
        for source in eligible_files(&source_dir)? {
            let Some(name) = source.file_name() else {
                continue;
            };
            link_or_copy(&source, &target_dir.join(name))?;
            placed += 1;
        }
        Ok(placed)
    }

    /// Remove every corpus under the work directory.
    ///
    /// Called at startup, before any job runs: a corpus that is still on disk
    /// then belongs to a process that exited mid-retrain.
    pub fn sweep_stale(&self) -> Result<usize, SyncError> {
        let entries = match fs::read_dir(&self.work_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(SyncError::io(&self.work_dir, err)),
        };
        let mut removed = 0usize;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::io(&self.work_dir, err))?;
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|err| SyncError::io(&path, err))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(
                "Removed {removed} stale corpus entries from {}",
                self.work_dir.display()
            );
        }
        Ok(removed)
    }

    /// Remove a job's corpus directory.
    pub fn discard(&self, corpus: &SyncedCorpus) {
        if let Err(err) = fs::remove_dir_all(&corpus.root)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove corpus {}: {err}", corpus.root.display());
        }
    }

    /// Directory names directly under the media root.
    pub fn folder_names(&self) -> Result<BTreeSet<String>, SyncError> {
        let mut names = BTreeSet::new();
        let entries = match fs::read_dir(&self.media_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(SyncError::io(&self.media_root, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::io(&self.media_root, err))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.insert(name);
            }
        }
        Ok(names)
    }
}

fn mismatch_report(
    classes: &[String],
    folders: &BTreeSet<String>,
    media_root: &Path,
) -> Result<MismatchReport, SyncError> {
    let registry: BTreeSet<&String> = classes.iter().collect();
    let missing_folders = classes
        .iter()
        .filter(|name| !folders.contains(*name))
        .cloned()
        .collect();
    let extra_folders: Vec<String> = folders
        .iter()
        .filter(|name| !registry.contains(name))
        .cloned()
        .collect();
    let mut unmapped_files = 0usize;
    for folder in &extra_folders {
        unmapped_files += eligible_files(&media_root.join(folder))?.len();
    }
    Ok(MismatchReport {
        missing_folders,
        extra_folders,
        unmapped_files,
    })
}

fn eligible_files(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| SyncError::io(dir, err))? {
        let entry = entry.map_err(|err| SyncError::io(dir, err))?;
        let path = entry.path();
        if path.is_file() && is_eligible_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn link_or_copy(source: &Path, target: &Path) -> Result<(), SyncError> {
    if fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .map(|_| ())
        .map_err(|err| SyncError::io(target, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn registry_wins_over_folders() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("media");
        fs::create_dir_all(media.join("pizza")).unwrap();
        fs::create_dir_all(media.join("orphaned")).unwrap();
        fs::write(media.join("pizza").join("a.png"), b"a").unwrap();
        fs::write(media.join("orphaned").join("b.png"), b"b").unwrap();

        let sync = DatasetSynchronizer::new(&media, dir.path().join("work"));
        let corpus = sync
            .synchronize(&names(&["steak", "pizza"]), "job-1")
            .unwrap();
        assert_eq!(corpus.classes, names(&["pizza", "steak"]));
        assert_eq!(corpus.report.missing_folders, names(&["steak"]));
        assert_eq!(corpus.report.extra_folders, names(&["orphaned"]));
        assert_eq!(corpus.report.unmapped_files, 1);
        assert_eq!(corpus.files, 1);
        assert!(corpus.root.join("steak").is_dir());
        assert!(corpus.root.join("orphaned").join("b.png").is_file());
        assert!(corpus.root.join("pizza").join("a.png").is_file());

        let samples = collect_corpus_samples(&corpus.root, &corpus.classes).unwrap();
        let placed: Vec<_> = samples.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(placed, vec!["a.png"]);
    }

    #[test]
    fn sweep_removes_leftover_corpora() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let sync = DatasetSynchronizer::new(dir.path().join("media"), &work);
        assert_eq!(sync.sweep_stale().unwrap(), 0);

        let first = sync.synchronize(&names(&["pizza"]), "job-a").unwrap();
        let second = sync.synchronize(&names(&["pizza"]), "job-b").unwrap();
        assert_eq!(sync.sweep_stale().unwrap(), 2);
        assert!(!first.root.exists());
        assert!(!second.root.exists());
        assert!(work.is_dir());
    }

    #[test]
    fn pending_and_hidden_files_are_skipped() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("media");
        fs::create_dir_all(media.join("pizza")).unwrap();
        fs::write(media.join("pizza").join("a.png"), b"a").unwrap();
        fs::write(media.join("pizza").join(".hidden.png"), b"h").unwrap();
        fs::write(
            media.join("pizza").join("b.png.refeed_pending_123"),
            b"p",
        )
        .unwrap();
        let sync = DatasetSynchronizer::new(&media, dir.path().join("work"));
        let corpus = sync.synchronize(&names(&["pizza"]), "job").unwrap();
        assert_eq!(corpus.files, 1);
    }

    #[test]
    fn discard_removes_corpus_root() {
        let dir = tempdir().unwrap();
        let sync = DatasetSynchronizer::new(dir.path().join("media"), dir.path().join("work"));
        let corpus = sync.synchronize(&names(&["pizza"]), "job").unwrap();
        assert!(corpus.root.is_dir());
        sync.discard(&corpus);
        assert!(!corpus.root.exists());
    }
}
