use std::path::{Path, PathBuf};
use std::time::Duration;

use refeed::config::{DataLayout, RefeedConfig};
use refeed::lifecycle::Lifecycle;
use refeed::training::{JobState, JobStatus};
use tempfile::TempDir;

/// Lifecycle rooted in a temp dir with settings small enough for tests.
pub struct LifecycleHarness {
    pub temp: TempDir,
    pub lifecycle: Lifecycle,
}

pub fn fast_config() -> RefeedConfig {
    let mut config = RefeedConfig::default();
    config.training.batch_size = 4;
    config.training.epochs = 30;
    config.training.learning_rate = 0.05;
    config.training.train_fraction = 0.75;
    config.training.seed = 7;
    config.pipeline.image_size = 4;
    config
}

impl LifecycleHarness {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let lifecycle = Lifecycle::open(&fast_config(), temp.path()).expect("open lifecycle");
        Self { temp, lifecycle }
    }

    /// Open a second lifecycle over the same data dir.
    pub fn reopen(&self) -> Lifecycle {
        Lifecycle::open(&fast_config(), self.temp.path()).expect("reopen lifecycle")
    }

    pub fn layout(&self) -> DataLayout {
        fast_config().layout(self.temp.path())
    }

    pub fn media_root(&self) -> PathBuf {
        self.layout().media_root()
    }

    /// Every regular file under the media root, relative and sorted.
    pub fn media_files(&self) -> Vec<PathBuf> {
        let root = self.media_root();
        let mut files = Vec::new();
        walk(&root, &root, &mut files);
        files.sort();
        files
    }

    /// Trigger a retrain and block until it finishes.
    pub fn retrain(&self) -> JobStatus {
        let id = self.lifecycle.trigger_retrain().expect("trigger retrain");
        let status = self
            .lifecycle
            .wait_for_retrain(&id, Duration::from_secs(120))
            .expect("job status");
        assert!(
            !matches!(status.state, JobState::Running),
            "retrain did not finish"
        );
        status
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
}
