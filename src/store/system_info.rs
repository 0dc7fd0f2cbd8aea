use rusqlite::{OptionalExtension, params};

use super::util::map_sql_error;
use super::{FeedbackDatabase, FeedbackWriteBatch, StoreError, SystemInfo};

impl FeedbackDatabase {
    /// Read the SystemInfo singleton; all fields are `None` before the first promotion.
    pub fn system_info(&self) -> Result<SystemInfo, StoreError> {
        let info = self
            .connection
            .query_row(
                "SELECT accuracy, last_trained_at, total_samples, model_id
                 FROM system_info WHERE id = 1",
                [],
                |row| {
                    Ok(SystemInfo {
                        accuracy: row.get::<_, Option<f64>>(0)?.map(|value| value as f32),
                        last_trained_at: row.get(1)?,
                        total_samples: row.get::<_, Option<i64>>(2)?.map(|value| value as u64),
                        model_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(map_sql_error)?;
        Ok(info.unwrap_or_default())
    }
}

impl FeedbackWriteBatch<'_> {
    /// Replace the SystemInfo singleton.
    pub fn write_system_info(&mut self, info: &SystemInfo) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO system_info (id, accuracy, last_trained_at, total_samples, model_id)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    accuracy = excluded.accuracy,
                    last_trained_at = excluded.last_trained_at,
                    total_samples = excluded.total_samples,
                    model_id = excluded.model_id",
                params![
                    info.accuracy.map(f64::from),
                    info.last_trained_at,
                    info.total_samples.map(|value| value as i64),
                    info.model_id,
                ],
            )
            .map_err(map_sql_error)?;
        Ok(())
    }
}
