use rusqlite::Connection;

/// SQL schema for dataset storage
const SCHEMA: &str = r#"
-- Datasets (the unit of subscription and broadcast)
CREATE TABLE IF NOT EXISTS datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    owner_id INTEGER,
    created_by_client TEXT,
    schema TEXT NOT NULL,               -- JSON: {"columns": [{"key", "type"}]}
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_datasets_name ON datasets(name);
CREATE INDEX IF NOT EXISTS idx_datasets_client ON datasets(created_by_client);

-- Dataset rows (schema-less JSON payloads, soft-deleted via archived)
CREATE TABLE IF NOT EXISTS dataset_rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    data TEXT NOT NULL,                 -- JSON: column key -> scalar value
    archived INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dataset_rows_dataset ON dataset_rows(dataset_id);
CREATE INDEX IF NOT EXISTS idx_dataset_rows_active ON dataset_rows(dataset_id, archived);

-- Audit trail for dataset lifecycle events
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    meta TEXT,                          -- JSON
    created_at INTEGER NOT NULL
);
"#;

/// Initialize the database schema
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }
}
