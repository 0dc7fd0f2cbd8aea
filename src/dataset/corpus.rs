use std::fs;
use std::path::{Path, PathBuf};

use crate::store::file_ops_journal::is_pending_file_name;

use super::SyncError;

/// One image in a synchronized corpus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorpusSample {
    /// Index into the ordered class list.
    pub class_idx: usize,
    /// Filename inside the class directory; stable across job directories.
    pub file_name: String,
    /// Absolute path to the image.
    pub path: PathBuf,
}

/// Files that can take part in training: no hidden, temp or pending files.
pub fn is_eligible_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    !(name.starts_with('.') || name.ends_with(".tmp") || is_pending_file_name(name))
}

/// Collect samples for `classes` from `root/<class>/` directories.
///
/// Directories for unknown classes are ignored; a missing class directory
/// contributes zero samples.
pub fn collect_corpus_samples(
    root: &Path,
    classes: &[String],
) -> Result<Vec<CorpusSample>, SyncError> {
    if !root.is_dir() {
        return Err(SyncError::CorpusNotFound(root.to_path_buf()));
    }
    let mut samples = Vec::new();
    for (class_idx, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(SyncError::io(&dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::io(&dir, err))?;
            let path = entry.path();
            if !path.is_file() || !is_eligible_file(&path) {
                continue;
            }
            samples.push(CorpusSample {
                class_idx,
                file_name: entry.file_name().to_string_lossy().to_string(),
                path,
            });
        }
    }
    samples.sort_by(|a, b| (a.class_idx, &a.file_name).cmp(&(b.class_idx, &b.file_name)));
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_root_is_reported() {
        let dir = tempdir().unwrap();
        let err = collect_corpus_samples(&dir.path().join("nope"), &["a".to_string()]).unwrap_err();
        assert!(matches!(err, SyncError::CorpusNotFound(_)));
    }

    #[test]
    fn samples_follow_class_order() {
        let dir = tempdir().unwrap();
        for (class, file) in [("steak", "x.png"), ("pizza", "b.png"), ("pizza", "a.png")] {
            fs::create_dir_all(dir.path().join(class)).unwrap();
            fs::write(dir.path().join(class).join(file), b"i").unwrap();
        }
        fs::create_dir_all(dir.path().join("extra")).unwrap();
        fs::write(dir.path().join("extra").join("z.png"), b"i").unwrap();
        let classes = vec!["pizza".to_string(), "steak".to_string()];
        let samples = collect_corpus_samples(dir.path(), &classes).unwrap();
        let keys: Vec<_> = samples
            .iter()
            .map(|s| (s.class_idx, s.file_name.as_str()))
            .collect();
        assert_eq!(keys, vec![(0, "a.png"), (0, "b.png"), (1, "x.png")]);
    }
}
