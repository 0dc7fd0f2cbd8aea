use rusqlite::Connection;

use super::StoreError;
use super::util::map_sql_error;

pub(super) fn apply_schema(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS labels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS feedback_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label_id INTEGER NOT NULL REFERENCES labels(id) ON DELETE RESTRICT,
                image_path TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                is_correct INTEGER,
                token TEXT NOT NULL UNIQUE
             );
             CREATE INDEX IF NOT EXISTS idx_feedback_samples_label
                ON feedback_samples (label_id);
             CREATE INDEX IF NOT EXISTS idx_feedback_samples_created
                ON feedback_samples (created_at DESC, id DESC);
             CREATE TABLE IF NOT EXISTS system_info (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                accuracy REAL,
                last_trained_at INTEGER,
                total_samples INTEGER,
                model_id TEXT
             );
             CREATE TABLE IF NOT EXISTS file_ops_journal (
                id TEXT PRIMARY KEY,
                sample_id INTEGER NOT NULL,
                from_path TEXT NOT NULL,
                to_path TEXT NOT NULL,
                to_label_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                created_at INTEGER NOT NULL
             );",
        )
        .map_err(map_sql_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('labels', 'feedback_samples', 'system_info', 'file_ops_journal')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn system_info_is_a_singleton() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn.execute("INSERT INTO system_info (id) VALUES (1)", [])
            .unwrap();
        assert!(
            conn.execute("INSERT INTO system_info (id) VALUES (2)", [])
                .is_err()
        );
    }
}
