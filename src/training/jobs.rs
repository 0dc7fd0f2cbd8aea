//! Retrain jobs: one background worker at a time with observable state.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RetrainReport;
use crate::ml::CancelFlag;

/// Identifier handed back when a retrain is triggered.
pub type JobId = String;

/// Finished jobs whose status stays queryable; older ones are forgotten.
pub const MAX_FINISHED_JOBS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded { report: RetrainReport },
    Failed { reason: String },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    /// Epoch seconds.
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

struct JobTable {
    statuses: HashMap<JobId, JobStatus>,
    /// Finish order, oldest first.
    finished: VecDeque<JobId>,
    running: Option<(JobId, CancelFlag)>,
    latest: Option<JobId>,
}

impl JobTable {
    fn record_finished(&mut self, id: &str) {
        self.finished.push_back(id.to_string());
        while self.finished.len() > MAX_FINISHED_JOBS {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.latest.as_deref() != Some(oldest.as_str()) {
                self.statuses.remove(&oldest);
            }
        }
    }
}

struct JobsInner {
    table: Mutex<JobTable>,
    changed: Condvar,
}

/// Tracks retrain jobs and runs each on its own worker thread.
///
/// Triggering while a job runs is refused with the running job's id.
#[derive(Clone)]
pub struct RetrainJobs {
    inner: Arc<JobsInner>,
}

impl Default for RetrainJobs {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrainJobs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobsInner {
                table: Mutex::new(JobTable {
                    statuses: HashMap::new(),
                    finished: VecDeque::new(),
                    running: None,
                    latest: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Start `work` in the background.
    ///
    /// `Err` carries the id of the job that is already running.
    pub fn trigger<F, E>(&self, max_duration: Option<Duration>, work: F) -> Result<JobId, JobId>
    where
        F: FnOnce(&str, &CancelFlag) -> Result<RetrainReport, E> + Send + 'static,
        E: Display,
    {
        let id: JobId = Uuid::new_v4().to_string();
        let cancel = CancelFlag::with_deadline(max_duration.map(|limit| Instant::now() + limit));
        {
            let mut table = self.lock();
            if let Some((running, _)) = table.running.as_ref() {
                return Err(running.clone());
            }
            table.running = Some((id.clone(), cancel.clone()));
            table.latest = Some(id.clone());
            table.statuses.insert(
                id.clone(),
                JobStatus {
                    id: id.clone(),
                    state: JobState::Running,
                    started_at: crate::store::util::now_epoch_seconds(),
                    finished_at: None,
                },
            );
        }
        let span = crate::logging::retrain_span(&id);
        span.in_scope(|| tracing::info!("Retrain job started"));

        let jobs = self.clone();
        let job_id = id.clone();
        // The worker logs to whatever subscriber the caller had.
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let worker_span = span.clone();
        let spawned = std::thread::Builder::new()
            .name("refeed-retrain".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _entered = worker_span.enter();
                    let result = catch_unwind(AssertUnwindSafe(|| work(&job_id, &cancel)));
                    let state = match result {
                        Ok(Ok(report)) => JobState::Succeeded { report },
                        Ok(Err(err)) => JobState::Failed {
                            reason: err.to_string(),
                        },
                        Err(_) => JobState::Failed {
                            reason: "retrain worker panicked".to_string(),
                        },
                    };
                    jobs.finish(&job_id, state);
                })
            });
        if let Err(err) = spawned {
            span.in_scope(|| {
                self.finish(
                    &id,
                    JobState::Failed {
                        reason: format!("failed to start retrain worker: {err}"),
                    },
                )
            });
        }
        Ok(id)
    }

    /// Status of a running job or one of the last [`MAX_FINISHED_JOBS`] finished ones.
    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.lock().statuses.get(id).cloned()
    }

    /// Most recently triggered job.
    pub fn latest(&self) -> Option<JobStatus> {
        let table = self.lock();
        table
            .latest
            .as_ref()
            .and_then(|id| table.statuses.get(id))
            .cloned()
    }

    pub fn running(&self) -> Option<JobId> {
        self.lock().running.as_ref().map(|(id, _)| id.clone())
    }

    /// Block until the job finishes or `timeout` elapses; returns the last seen status.
    pub fn wait(&self, id: &str, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock();
        loop {
            let status = table.statuses.get(id)?.clone();
            let now = Instant::now();
            if status.state.is_finished() || now >= deadline {
                return Some(status);
            }
            table = self
                .inner
                .changed
                .wait_timeout(table, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Ask a running job to stop. Returns `false` when `id` is not running.
    pub fn cancel(&self, id: &str) -> bool {
        let table = self.lock();
        match table.running.as_ref() {
            Some((running, cancel)) if running == id => {
                cancel.cancel();
                tracing::info!("Cancellation requested for retrain job {id}");
                true
            }
            _ => false,
        }
    }

    fn finish(&self, id: &str, state: JobState) {
        match &state {
            JobState::Succeeded { report } => {
                tracing::info!("Retrain job succeeded with model {}", report.model_id)
            }
            JobState::Failed { reason } => tracing::warn!("Retrain job failed: {reason}"),
            JobState::Running => {}
        }
        let mut table = self.lock();
        if let Some(status) = table.statuses.get_mut(id) {
            status.state = state;
            status.finished_at = Some(crate::store::util::now_epoch_seconds());
            table.record_finished(id);
        }
        if table
            .running
            .as_ref()
            .is_some_and(|(running, _)| running == id)
        {
            table.running = None;
        }
        drop(table);
        self.inner.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MismatchReport;
    use crate::training::TrainingReport;
    use std::sync::mpsc;

    fn report() -> RetrainReport {
        RetrainReport {
            model_id: "m1".to_string(),
            training: TrainingReport {
                classes: vec!["a".to_string(), "b".to_string()],
                train_size: 1,
                eval_size: 0,
                skipped: 0,
                epochs: Vec::new(),
                final_accuracy: 1.0,
                per_class: Vec::new(),
            },
            mismatch: MismatchReport::default(),
        }
    }

    #[test]
    fn job_reports_success() {
        let jobs = RetrainJobs::new();
        let id = jobs
            .trigger(None, |_, _| Ok::<_, String>(report()))
            .unwrap();
        let status = jobs.wait(&id, Duration::from_secs(5)).unwrap();
        assert!(matches!(status.state, JobState::Succeeded { .. }));
        assert!(status.finished_at.is_some());
        assert_eq!(jobs.running(), None);
        assert_eq!(jobs.latest().unwrap().id, id);
    }

    #[test]
    fn second_trigger_is_refused_while_running() {
        let jobs = RetrainJobs::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = jobs
            .trigger(None, move |_, _| {
                let _ = release_rx.recv();
                Ok::<_, String>(report())
            })
            .unwrap();
        let refused = jobs
            .trigger(None, |_, _| Ok::<_, String>(report()))
            .unwrap_err();
        assert_eq!(refused, first);
        release_tx.send(()).unwrap();
        jobs.wait(&first, Duration::from_secs(5)).unwrap();
        assert!(jobs.trigger(None, |_, _| Ok::<_, String>(report())).is_ok());
    }

    #[test]
    fn cancel_fails_job_with_reason() {
        let jobs = RetrainJobs::new();
        let id = jobs
            .trigger(None, |_, cancel: &CancelFlag| {
                while cancel.check().is_ok() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                cancel.check().map(|()| report()).map_err(|err| err.to_string())
            })
            .unwrap();
        assert!(jobs.cancel(&id));
        let status = jobs.wait(&id, Duration::from_secs(5)).unwrap();
        match status.state {
            JobState::Failed { reason } => assert!(reason.contains("cancel")),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(!jobs.cancel(&id));
    }

    #[test]
    fn deadline_fails_job() {
        let jobs = RetrainJobs::new();
        let id = jobs
            .trigger(Some(Duration::from_millis(10)), |_, cancel: &CancelFlag| {
                while cancel.check().is_ok() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                cancel.check().map(|()| report()).map_err(|err| err.to_string())
            })
            .unwrap();
        let status = jobs.wait(&id, Duration::from_secs(5)).unwrap();
        match status.state {
            JobState::Failed { reason } => assert!(reason.contains("time limit")),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn panicking_worker_is_reported() {
        let jobs = RetrainJobs::new();
        let id = jobs
            .trigger(None, |_, _| -> Result<RetrainReport, String> {
                panic!("boom")
            })
            .unwrap();
        let status = jobs.wait(&id, Duration::from_secs(5)).unwrap();
        assert!(matches!(status.state, JobState::Failed { .. }));
    }

    #[test]
    fn finished_history_is_bounded() {
        let jobs = RetrainJobs::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_FINISHED_JOBS + 4 {
            let id = jobs
                .trigger(None, |_, _| Ok::<_, String>(report()))
                .unwrap();
            jobs.wait(&id, Duration::from_secs(5)).unwrap();
            ids.push(id);
        }
        assert_eq!(jobs.lock().statuses.len(), MAX_FINISHED_JOBS);
        for forgotten in &ids[..4] {
            assert!(jobs.status(forgotten).is_none());
        }
        for kept in &ids[4..] {
            assert!(jobs.status(kept).is_some());
        }
        assert_eq!(jobs.latest().unwrap().id, *ids.last().unwrap());
    }

    #[test]
    fn unknown_job_has_no_status() {
        let jobs = RetrainJobs::new();
        assert!(jobs.status("nope").is_none());
        assert!(jobs.wait("nope", Duration::from_millis(1)).is_none());
    }
}
