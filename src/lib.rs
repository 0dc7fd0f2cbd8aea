//! Feedback-driven retraining for an image classifier.
//!
//! Feedback images are filed per label, periodically synchronized into a
//! training corpus, trained into a candidate artifact and atomically
//! promoted to serve predictions.

/// Application directory helpers.
pub mod app_dirs;
/// Service configuration.
pub mod config;
/// Corpus synchronization and partitioning.
pub mod dataset;
/// Feedback Store: files plus records.
pub mod feedback;
mod fs_ops;
/// Facade used by transports and the CLI.
pub mod lifecycle;
/// Tracing setup.
pub mod logging;
/// Models, artifacts and training procedures.
pub mod ml;
/// Image preprocessing.
pub mod pipeline;
/// Live model slot and prediction serving.
pub mod serving;
/// SQLite-backed label registry and sample records.
pub mod store;
/// Retrain orchestration and jobs.
pub mod training;
