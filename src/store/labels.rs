use rusqlite::{OptionalExtension, Row, params};

use super::util::{map_sql_error, validate_label_name};
use super::{
    FeedbackDatabase, FeedbackWriteBatch, Label, LabelId, LabelRef, LabelSummary, StoreError,
};

fn label_from_row(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

impl FeedbackDatabase {
    /// Create a label, failing with `DuplicateLabel` when the name exists.
    pub fn create_label(&self, name: &str) -> Result<Label, StoreError> {
        let mut batch = self.write_batch()?;
        let label = batch.create_label(name)?;
        batch.commit()?;
        Ok(label)
    }

    /// All labels sorted by name.
    ///
    /// This order defines model output indices, so it must stay a plain
    /// byte-wise sort of the names.
    pub fn list_labels(&self) -> Result<Vec<Label>, StoreError> {
        let mut stmt = self
            .connection
            .prepare_cached("SELECT id, name FROM labels ORDER BY name ASC")
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], label_from_row)
            .map_err(map_sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sql_error)?;
        Ok(rows)
    }

    /// Sorted label names, i.e. the output-class ordering for training.
    pub fn label_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .list_labels()?
            .into_iter()
            .map(|label| label.name)
            .collect())
    }

    /// Labels with their sample counts, sorted by name.
    pub fn list_label_summaries(&self) -> Result<Vec<LabelSummary>, StoreError> {
        let mut stmt = self
            .connection
            .prepare_cached(
                "SELECT labels.id, labels.name, COUNT(feedback_samples.id)
                 FROM labels
                 LEFT JOIN feedback_samples ON feedback_samples.label_id = labels.id
                 GROUP BY labels.id
                 ORDER BY labels.name ASC",
            )
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LabelSummary {
                    label: label_from_row(row)?,
                    sample_count: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(map_sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sql_error)?;
        Ok(rows)
    }

    pub fn label_by_id(&self, id: LabelId) -> Result<Option<Label>, StoreError> {
        self.connection
            .query_row(
                "SELECT id, name FROM labels WHERE id = ?1",
                params![id],
                label_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    pub fn label_by_name(&self, name: &str) -> Result<Option<Label>, StoreError> {
        self.connection
            .query_row(
                "SELECT id, name FROM labels WHERE name = ?1",
                params![name.trim()],
                label_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    /// Resolve a reference to an existing label.
    pub fn resolve_label(&self, label: &LabelRef) -> Result<Label, StoreError> {
        let found = match label {
            LabelRef::Id(id) => self.label_by_id(*id)?,
            LabelRef::Name(name) => self.label_by_name(name)?,
        };
        found.ok_or_else(|| StoreError::LabelNotFound(label.clone()))
    }

    pub fn count_labels(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM labels", [], |row| row.get(0))
            .map_err(map_sql_error)?;
        Ok(count as u64)
    }
}

impl FeedbackWriteBatch<'_> {
    /// Insert a new label; duplicate names are rejected.
    pub fn create_label(&mut self, name: &str) -> Result<Label, StoreError> {
        let name = validate_label_name(name)?;
        let inserted = self
            .tx
            .prepare_cached("INSERT INTO labels (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
            .map_err(map_sql_error)?
            .execute(params![name])
            .map_err(map_sql_error)?;
        if inserted == 0 {
            return Err(StoreError::DuplicateLabel(name));
        }
        Ok(Label {
            id: self.tx.last_insert_rowid(),
            name,
        })
    }

    /// Fetch a label by name, creating it when absent.
    ///
    /// Returns the label and whether it was created by this call.
    pub fn get_or_create_label(&mut self, name: &str) -> Result<(Label, bool), StoreError> {
        let name = validate_label_name(name)?;
        let existing = self
            .tx
            .query_row(
                "SELECT id, name FROM labels WHERE name = ?1",
                params![name],
                label_from_row,
            )
            .optional()
            .map_err(map_sql_error)?;
        if let Some(label) = existing {
            return Ok((label, false));
        }
        Ok((self.create_label(&name)?, true))
    }

    pub fn label_by_id(&self, id: LabelId) -> Result<Option<Label>, StoreError> {
        self.tx
            .query_row(
                "SELECT id, name FROM labels WHERE id = ?1",
                params![id],
                label_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    pub fn label_by_name(&self, name: &str) -> Result<Option<Label>, StoreError> {
        self.tx
            .query_row(
                "SELECT id, name FROM labels WHERE name = ?1",
                params![name.trim()],
                label_from_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    pub fn count_samples_for_label(&self, id: LabelId) -> Result<u64, StoreError> {
        let count: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM feedback_samples WHERE label_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(map_sql_error)?;
        Ok(count as u64)
    }

    /// Delete a label row. Fails with `LabelInUse` while samples reference it.
    pub fn delete_label(&mut self, id: LabelId) -> Result<Label, StoreError> {
        let label = self
            .label_by_id(id)?
            .ok_or(StoreError::LabelNotFound(LabelRef::Id(id)))?;
        let samples = self.count_samples_for_label(id)?;
        if samples > 0 {
            return Err(StoreError::LabelInUse {
                name: label.name,
                samples,
            });
        }
        self.tx
            .execute("DELETE FROM labels WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        Ok(label)
    }
}
