use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use tempfile::NamedTempFile;

use super::FeedbackError;

/// Removes its file on drop unless the owning operation committed.
pub(super) struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    pub(super) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file: the record that references it is committed.
    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = crate::fs_ops::remove_file_if_exists(&self.path) {
            tracing::warn!(
                "Failed to clean up staged file {}: {err}",
                self.path.display()
            );
        }
    }
}

/// File extension for the detected image format of `bytes`.
pub(super) fn image_extension(bytes: &[u8]) -> Result<&'static str, FeedbackError> {
    if bytes.is_empty() {
        return Err(FeedbackError::EmptyImage);
    }
    let format = image::guess_format(bytes).map_err(|_| FeedbackError::UnrecognizedImage)?;
    extension_for(format).ok_or(FeedbackError::UnrecognizedImage)
}

fn extension_for(format: ImageFormat) -> Option<&'static str> {
    format.extensions_str().first().copied()
}

/// Write `bytes` to `target` without ever exposing a partial file there.
///
/// Fails if `target` already exists.
pub(super) fn write_new_file(target: &Path, bytes: &[u8]) -> Result<StagedFile, FeedbackError> {
    let dir = target
        .parent()
        .ok_or_else(|| FeedbackError::io(target, std::io::Error::other("no parent directory")))?;
    fs::create_dir_all(dir).map_err(|err| FeedbackError::io(dir, err))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|err| FeedbackError::io(dir, err))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| FeedbackError::io(tmp.path(), err))?;
    tmp.persist_noclobber(target)
        .map_err(|err| FeedbackError::io(target, err.error))?;
    Ok(StagedFile::new(target.to_path_buf()))
}

/// Copy `from` to the staging name `staged`.
///
/// The guard is armed before the copy starts, so a failed or partial copy
/// never outlives this call.
pub(super) fn stage_copy(from: &Path, staged: &Path) -> Result<StagedFile, FeedbackError> {
    if let Some(dir) = staged.parent() {
        fs::create_dir_all(dir).map_err(|err| FeedbackError::io(dir, err))?;
    }
    let guard = StagedFile::new(staged.to_path_buf());
    fs::copy(from, staged).map_err(|err| FeedbackError::io(from, err))?;
    fs::File::open(staged)
        .and_then(|file| file.sync_all())
        .map_err(|err| FeedbackError::io(staged, err))?;
    Ok(guard)
}

/// Publish a staged copy under its final name.
///
/// Fails if `to` already exists, so a concurrent move that landed first is
/// never overwritten. The staging name is removed either way.
pub(super) fn install_staged(staged: StagedFile, to: &Path) -> Result<StagedFile, FeedbackError> {
    fs::hard_link(staged.path(), to).map_err(|err| FeedbackError::io(to, err))?;
    drop(staged);
    Ok(StagedFile::new(to.to_path_buf()))
}

/// Best-effort removal used after the record is already authoritative.
pub(super) fn remove_best_effort(path: &Path) -> bool {
    match crate::fs_ops::remove_file_if_exists(path) {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!("Image file already missing: {}", path.display());
            false
        }
        Err(err) => {
            tracing::warn!("Failed to remove image file {}: {err}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn detects_extension_from_content() {
        assert_eq!(image_extension(&png_bytes()).unwrap(), "png");
        assert!(matches!(
            image_extension(b"not an image"),
            Err(FeedbackError::UnrecognizedImage)
        ));
        assert!(matches!(image_extension(&[]), Err(FeedbackError::EmptyImage)));
    }

    #[test]
    fn staged_file_is_removed_unless_disarmed() {
        let dir = tempdir().unwrap();
        let dropped = dir.path().join("a").join("dropped.png");
        let kept = dir.path().join("a").join("kept.png");
        drop(write_new_file(&dropped, b"x").unwrap());
        write_new_file(&kept, b"y").unwrap().disarm();
        assert!(!dropped.exists());
        assert_eq!(fs::read(&kept).unwrap(), b"y");
    }

    #[test]
    fn write_new_file_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x.png");
        fs::write(&target, b"original").unwrap();
        assert!(write_new_file(&target, b"new").is_err());
        assert_eq!(fs::read(&target).unwrap(), b"original");
    }

    #[test]
    fn failed_copy_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("steak").join("a.png.pending");
        let missing = dir.path().join("pizza").join("missing.png");
        assert!(stage_copy(&missing, &staged).is_err());
        assert!(!staged.exists());
    }

    #[test]
    fn install_refuses_to_replace_existing_target() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a.png");
        fs::write(&from, b"moved").unwrap();
        let target = dir.path().join("steak").join("a.png");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"winner").unwrap();

        let staged = stage_copy(&from, &dir.path().join("steak").join("a.png.pending")).unwrap();
        let staged_path = staged.path().to_path_buf();
        assert!(install_staged(staged, &target).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"winner");
        assert!(!staged_path.exists());

        fs::remove_file(&target).unwrap();
        let staged = stage_copy(&from, &staged_path).unwrap();
        install_staged(staged, &target).unwrap().disarm();
        assert_eq!(fs::read(&target).unwrap(), b"moved");
        assert!(!staged_path.exists());
    }
}
