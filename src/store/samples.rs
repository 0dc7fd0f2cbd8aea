use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::util::{map_sql_error, normalize_relative_path, parse_relative_path_from_db};
use super::{
    Correctness, FeedbackDatabase, FeedbackPage, FeedbackSample, FeedbackWriteBatch, Label,
    LabelId, Page, SampleId, StoreError,
};

const SAMPLE_COLUMNS: &str = "feedback_samples.id, feedback_samples.label_id, labels.name,
        feedback_samples.image_path, feedback_samples.created_at,
        feedback_samples.is_correct, feedback_samples.token
     FROM feedback_samples
     JOIN labels ON labels.id = feedback_samples.label_id";

/// Values for a sample row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewSample<'a> {
    pub label_id: LabelId,
    pub image_path: &'a Path,
    pub correctness: Correctness,
    pub token: Uuid,
    pub created_at: i64,
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<FeedbackSample> {
    let raw_path: String = row.get(3)?;
    let image_path = parse_relative_path_from_db(&raw_path)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    let raw_token: String = row.get(6)?;
    let token = Uuid::parse_str(&raw_token)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err)))?;
    Ok(FeedbackSample {
        id: row.get(0)?,
        label: Label {
            id: row.get(1)?,
            name: row.get(2)?,
        },
        image_path,
        created_at: row.get(4)?,
        correctness: Correctness::from_db(row.get(5)?),
        token,
    })
}

impl FeedbackDatabase {
    pub fn sample_by_id(&self, id: SampleId) -> Result<Option<FeedbackSample>, StoreError> {
        self.connection
            .query_row(
                &format!("SELECT {SAMPLE_COLUMNS} WHERE feedback_samples.id = ?1"),
                params![id],
                sample_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    pub fn sample_by_token(&self, token: &Uuid) -> Result<Option<FeedbackSample>, StoreError> {
        self.connection
            .query_row(
                &format!("SELECT {SAMPLE_COLUMNS} WHERE feedback_samples.token = ?1"),
                params![token.to_string()],
                sample_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    /// Newest-first page of feedback, optionally restricted to one label.
    pub fn list_samples(
        &self,
        page: Page,
        label: Option<LabelId>,
    ) -> Result<FeedbackPage, StoreError> {
        let limit = page.limit.min(i64::MAX as u64) as i64;
        let offset = page.offset.min(i64::MAX as u64) as i64;
        let mut stmt = self
            .connection
            .prepare_cached(&format!(
                "SELECT {SAMPLE_COLUMNS}
                 WHERE ?1 IS NULL OR feedback_samples.label_id = ?1
                 ORDER BY feedback_samples.created_at DESC, feedback_samples.id DESC
                 LIMIT ?2 OFFSET ?3"
            ))
            .map_err(map_sql_error)?;
        let items = stmt
            .query_map(params![label, limit, offset], sample_from_row)
            .map_err(map_sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sql_error)?;
        let total: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM feedback_samples WHERE ?1 IS NULL OR label_id = ?1",
                params![label],
                |row| row.get(0),
            )
            .map_err(map_sql_error)?;
        Ok(FeedbackPage {
            items,
            total: total as u64,
        })
    }

    pub fn count_samples(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM feedback_samples", [], |row| row.get(0))
            .map_err(map_sql_error)?;
        Ok(count as u64)
    }
}

impl FeedbackWriteBatch<'_> {
    pub fn insert_sample(&mut self, sample: &NewSample<'_>) -> Result<SampleId, StoreError> {
        let path = normalize_relative_path(sample.image_path)?;
        self.tx
            .prepare_cached(
                "INSERT INTO feedback_samples (label_id, image_path, created_at, is_correct, token)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(map_sql_error)?
            .execute(params![
                sample.label_id,
                path,
                sample.created_at,
                sample.correctness.as_db(),
                sample.token.to_string(),
            ])
            .map_err(map_sql_error)?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn sample_by_id(&self, id: SampleId) -> Result<Option<FeedbackSample>, StoreError> {
        self.tx
            .query_row(
                &format!("SELECT {SAMPLE_COLUMNS} WHERE feedback_samples.id = ?1"),
                params![id],
                sample_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    pub fn samples_for_label(&self, label: LabelId) -> Result<Vec<FeedbackSample>, StoreError> {
        let mut stmt = self
            .tx
            .prepare_cached(&format!(
                "SELECT {SAMPLE_COLUMNS} WHERE feedback_samples.label_id = ?1
                 ORDER BY feedback_samples.id ASC"
            ))
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params![label], sample_from_row)
            .map_err(map_sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sql_error)?;
        Ok(rows)
    }

    /// Point a sample at a new label and image location.
    ///
    /// Only applies while the record still points at `expected_path`; a
    /// concurrent move of the same sample yields `StaleSample`.
    pub fn update_sample_location(
        &mut self,
        id: SampleId,
        expected_path: &Path,
        label: LabelId,
        image_path: &Path,
    ) -> Result<(), StoreError> {
        let expected = normalize_relative_path(expected_path)?;
        let path = normalize_relative_path(image_path)?;
        let updated = self
            .tx
            .execute(
                "UPDATE feedback_samples SET label_id = ?1, image_path = ?2
                 WHERE id = ?3 AND image_path = ?4",
                params![label, path, id, expected],
            )
            .map_err(map_sql_error)?;
        if updated == 0 {
            return match self.sample_by_id(id)? {
                Some(_) => Err(StoreError::StaleSample(id)),
                None => Err(StoreError::SampleNotFound(id)),
            };
        }
        Ok(())
    }

    /// Delete a sample row. Returns whether a row existed.
    pub fn delete_sample(&mut self, id: SampleId) -> Result<bool, StoreError> {
        let removed = self
            .tx
            .execute("DELETE FROM feedback_samples WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        Ok(removed > 0)
    }
}
