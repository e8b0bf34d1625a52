use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Columns a dataset starts with when the creator supplies none.
pub const DEFAULT_COLUMNS: &[&str] = &[
    "KKC CODE",
    "CHAPTER",
    "BODY PART",
    "MODALITY",
    "OCTR UI",
    "DX",
    "DZ",
    "DZ PRIOR",
    "AGE CODE",
    "SEX",
    "IMPRESSION",
    "LOG COMPLETE",
];

/// One column descriptor in a dataset schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub key: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl ColumnDef {
    fn string(key: impl Into<String>) -> Self {
        ColumnDef {
            key: key.into(),
            ty: "string".to_string(),
        }
    }
}

/// Ordered dataset schema. Keys are unique; the schema is advisory, and row
/// payloads may carry keys that are not (yet) declared here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    /// Build a schema from column keys: trimmed, empties dropped, duplicates
    /// dropped (first occurrence wins).
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut columns: Vec<ColumnDef> = Vec::new();
        for key in keys {
            let key = key.as_ref().trim();
            if key.is_empty() || columns.iter().any(|c| c.key == key) {
                continue;
            }
            columns.push(ColumnDef::string(key));
        }
        Schema { columns }
    }

    /// The documented default column set.
    pub fn default_set() -> Self {
        Schema::from_keys(DEFAULT_COLUMNS)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.columns.iter().any(|c| c.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.key.as_str())
    }
}

/// Dataset record
#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub schema: Schema,
    pub owner_id: Option<i64>,
    pub created_by_client: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lightweight dataset listing entry
#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub id: i64,
    pub name: String,
    pub updated_at: i64,
}

/// Row record. `data` is an open mapping of column key to scalar value.
#[derive(Debug, Clone)]
pub struct Row {
    pub id: i64,
    pub dataset_id: i64,
    pub data: Map<String, Value>,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Row {
    /// The wire projection of a row: its field mapping plus `id`.
    pub fn to_api_json(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("id".to_string(), Value::from(self.id));
        Value::Object(map)
    }
}

/// Result of an upsert: either a newly created row or a full replace of an
/// existing row's data mapping.
#[derive(Debug)]
pub enum UpsertOutcome {
    Created(Row),
    Replaced(Row),
}

/// Result of a schema add-column attempt.
#[derive(Debug)]
pub enum AddColumnOutcome {
    Added(Schema),
    Duplicate,
    DatasetMissing,
}

/// Dataset repository over a single SQLite connection.
///
/// Every operation holds the connection mutex for its whole statement
/// sequence, so mutations are serialized per database and a mutation is
/// never observed half-applied.
#[derive(Clone)]
pub struct DatasetRepo {
    conn: Arc<Mutex<Connection>>,
}

impl DatasetRepo {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    // ===== Dataset operations =====

    /// Create a dataset with the given (already validated) name and schema.
    pub fn create_dataset(
        &self,
        name: &str,
        schema: &Schema,
        created_by_client: Option<&str>,
    ) -> Result<Dataset, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        let schema_json = schema_to_json(schema)?;

        conn.execute(
            "INSERT INTO datasets (name, created_by_client, schema, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![name, created_by_client, schema_json, now, now],
        )?;

        let id = conn.last_insert_rowid();
        Ok(Dataset {
            id,
            name: name.to_string(),
            schema: schema.clone(),
            owner_id: None,
            created_by_client: created_by_client.map(String::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a dataset by ID
    pub fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        get_dataset_inner(&conn, id)
    }

    /// List all datasets, most recently updated first
    pub fn list_datasets(&self) -> Result<Vec<DatasetSummary>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, updated_at FROM datasets ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], summary_from_sql)?;
        rows.collect()
    }

    /// List datasets created by an anonymous client, most recently updated first
    pub fn list_datasets_by_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<DatasetSummary>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, updated_at FROM datasets
             WHERE created_by_client = ? ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([client_id], summary_from_sql)?;
        rows.collect()
    }

    /// Append a `{key, "string"}` column to the dataset schema. The schema
    /// update is the only side effect; existing rows keep their values.
    /// Duplicate keys (case-sensitive exact match) are rejected.
    pub fn add_column(
        &self,
        dataset_id: i64,
        key: &str,
    ) -> Result<AddColumnOutcome, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let Some(dataset) = get_dataset_inner(&conn, dataset_id)? else {
            return Ok(AddColumnOutcome::DatasetMissing);
        };

        if dataset.schema.has_key(key) {
            return Ok(AddColumnOutcome::Duplicate);
        }

        let mut schema = dataset.schema;
        schema.columns.push(ColumnDef::string(key));
        update_schema_inner(&conn, dataset_id, &schema)?;
        Ok(AddColumnOutcome::Added(schema))
    }

    /// Replace the dataset schema wholesale (import's observed policy).
    pub fn replace_schema(
        &self,
        dataset_id: i64,
        schema: &Schema,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        update_schema_inner(&conn, dataset_id, schema)
    }

    // ===== Row operations =====

    /// List non-archived rows ordered by id ascending, with total count.
    ///
    /// `query` is a case-insensitive substring match against the stored JSON
    /// projection of the row's entire field mapping. `limit` is clamped to
    /// [1, 2000].
    pub fn list_rows(
        &self,
        dataset_id: i64,
        query: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<Row>), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.clamp(1, 2000);

        match query.filter(|q| !q.is_empty()) {
            Some(q) => {
                let total = conn.query_row(
                    "SELECT COUNT(*) FROM dataset_rows
                     WHERE dataset_id = ? AND archived = 0
                       AND instr(lower(data), lower(?)) > 0",
                    params![dataset_id, q],
                    |row| row.get::<_, i64>(0),
                )?;
                let stmt = conn.prepare(
                    "SELECT id, dataset_id, data, archived, created_at, updated_at
                     FROM dataset_rows
                     WHERE dataset_id = ?1 AND archived = 0
                       AND instr(lower(data), lower(?2)) > 0
                     ORDER BY id ASC LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt_rows(stmt, params![dataset_id, q, limit, offset])?;
                Ok((total, rows))
            }
            None => {
                let total = conn.query_row(
                    "SELECT COUNT(*) FROM dataset_rows WHERE dataset_id = ? AND archived = 0",
                    params![dataset_id],
                    |row| row.get::<_, i64>(0),
                )?;
                let stmt = conn.prepare(
                    "SELECT id, dataset_id, data, archived, created_at, updated_at
                     FROM dataset_rows
                     WHERE dataset_id = ?1 AND archived = 0
                     ORDER BY id ASC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt_rows(stmt, params![dataset_id, limit, offset])?;
                Ok((total, rows))
            }
        }
    }

    /// Insert a row, or replace an existing row's entire data mapping when
    /// `id` names a row of this dataset. The replace is wholesale, not a
    /// field-by-field merge. An unknown or absent `id` creates a new row
    /// with a fresh store-assigned id.
    pub fn upsert_row(
        &self,
        dataset_id: i64,
        id: Option<i64>,
        fields: Map<String, Value>,
    ) -> Result<UpsertOutcome, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        if let Some(row_id) = id {
            let existing = conn
                .query_row(
                    "SELECT id, dataset_id, data, archived, created_at, updated_at
                     FROM dataset_rows WHERE dataset_id = ? AND id = ?",
                    params![dataset_id, row_id],
                    row_from_sql,
                )
                .optional()?;

            if let Some(mut row) = existing {
                let data_json = map_to_json(&fields)?;
                conn.execute(
                    "UPDATE dataset_rows SET data = ?, updated_at = ? WHERE id = ?",
                    params![data_json, now, row_id],
                )?;
                touch_dataset_inner(&conn, dataset_id, now)?;
                row.data = fields;
                row.updated_at = now;
                return Ok(UpsertOutcome::Replaced(row));
            }
        }

        let data_json = map_to_json(&fields)?;
        conn.execute(
            "INSERT INTO dataset_rows (dataset_id, data, archived, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?)",
            params![dataset_id, data_json, now, now],
        )?;
        let row_id = conn.last_insert_rowid();
        touch_dataset_inner(&conn, dataset_id, now)?;

        Ok(UpsertOutcome::Created(Row {
            id: row_id,
            dataset_id,
            data: fields,
            archived: false,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Set a single cell. Returns the updated row, or None if the row is
    /// missing or archived. Only `data[key]` changes; the rest of the
    /// mapping is untouched.
    pub fn patch_cell(
        &self,
        dataset_id: i64,
        row_id: i64,
        key: &str,
        value: Value,
    ) -> Result<Option<Row>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, dataset_id, data, archived, created_at, updated_at
                 FROM dataset_rows WHERE dataset_id = ? AND id = ? AND archived = 0",
                params![dataset_id, row_id],
                row_from_sql,
            )
            .optional()?;

        let Some(mut row) = existing else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        row.data.insert(key.to_string(), value);
        row.updated_at = now;

        let data_json = map_to_json(&row.data)?;
        conn.execute(
            "UPDATE dataset_rows SET data = ?, updated_at = ? WHERE id = ?",
            params![data_json, now, row_id],
        )?;
        touch_dataset_inner(&conn, dataset_id, now)?;

        Ok(Some(row))
    }

    /// Soft-delete rows by id. Already-archived and unknown ids are no-ops.
    /// Returns the number of rows newly archived.
    pub fn archive_rows(&self, dataset_id: i64, ids: &[i64]) -> Result<usize, rusqlite::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE dataset_rows SET archived = 1, updated_at = ?
             WHERE dataset_id = ? AND archived = 0 AND id IN ({placeholders})"
        );

        let mut values: Vec<rusqlite::types::Value> =
            vec![now.into(), dataset_id.into()];
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(*id)));

        let archived = conn.execute(&sql, params_from_iter(values))?;
        if archived > 0 {
            touch_dataset_inner(&conn, dataset_id, now)?;
        }
        Ok(archived)
    }

    /// Bulk-insert rows (import path). All rows are created; ids in the
    /// input are not honored here.
    pub fn insert_rows(
        &self,
        dataset_id: i64,
        rows: Vec<Map<String, Value>>,
    ) -> Result<Vec<Row>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let mut created = Vec::with_capacity(rows.len());
        for fields in rows {
            let data_json = map_to_json(&fields)?;
            conn.execute(
                "INSERT INTO dataset_rows (dataset_id, data, archived, created_at, updated_at)
                 VALUES (?, ?, 0, ?, ?)",
                params![dataset_id, data_json, now, now],
            )?;
            created.push(Row {
                id: conn.last_insert_rowid(),
                dataset_id,
                data: fields,
                archived: false,
                created_at: now,
                updated_at: now,
            });
        }

        if !created.is_empty() {
            touch_dataset_inner(&conn, dataset_id, now)?;
        }
        Ok(created)
    }

    /// All non-archived rows, id ascending (export path).
    pub fn export_rows(&self, dataset_id: i64) -> Result<Vec<Row>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let stmt = conn.prepare(
            "SELECT id, dataset_id, data, archived, created_at, updated_at
             FROM dataset_rows WHERE dataset_id = ? AND archived = 0 ORDER BY id ASC",
        )?;
        stmt_rows(stmt, params![dataset_id])
    }

    // ===== Audit =====

    /// Record an audit entry. Callers treat failures as non-fatal.
    pub fn record_audit(&self, action: &str, meta: Value) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO audit_log (action, meta, created_at) VALUES (?, ?, ?)",
            params![action, meta.to_string(), now],
        )?;
        Ok(())
    }
}

// ===== Internal helpers =====

fn get_dataset_inner(conn: &Connection, id: i64) -> Result<Option<Dataset>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, name, schema, owner_id, created_by_client, created_at, updated_at
         FROM datasets WHERE id = ?",
        [id],
        |row| {
            Ok(Dataset {
                id: row.get(0)?,
                name: row.get(1)?,
                schema: json_column(row.get::<_, String>(2)?, 2)?,
                owner_id: row.get(3)?,
                created_by_client: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()
}

fn update_schema_inner(
    conn: &Connection,
    dataset_id: i64,
    schema: &Schema,
) -> Result<(), rusqlite::Error> {
    let now = Utc::now().timestamp();
    let schema_json = schema_to_json(schema)?;
    conn.execute(
        "UPDATE datasets SET schema = ?, updated_at = ? WHERE id = ?",
        params![schema_json, now, dataset_id],
    )?;
    Ok(())
}

fn touch_dataset_inner(
    conn: &Connection,
    dataset_id: i64,
    now: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE datasets SET updated_at = ? WHERE id = ?",
        params![now, dataset_id],
    )?;
    Ok(())
}

fn summary_from_sql(row: &rusqlite::Row<'_>) -> Result<DatasetSummary, rusqlite::Error> {
    Ok(DatasetSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> Result<Row, rusqlite::Error> {
    Ok(Row {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        data: json_column(row.get::<_, String>(2)?, 2)?,
        archived: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn stmt_rows(
    mut stmt: rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<Row>, rusqlite::Error> {
    let rows = stmt.query_map(params, row_from_sql)?;
    rows.collect()
}

fn json_column<T: serde::de::DeserializeOwned>(
    raw: String,
    idx: usize,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn schema_to_json(schema: &Schema) -> Result<String, rusqlite::Error> {
    serde_json::to_string(schema)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn map_to_json(map: &Map<String, Value>) -> Result<String, rusqlite::Error> {
    serde_json::to_string(map)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

/// Render an epoch-second timestamp the way the API reports times.
pub fn rfc3339(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use serde_json::json;

    fn test_repo() -> DatasetRepo {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        DatasetRepo::new(conn)
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn create(repo: &DatasetRepo, name: &str, columns: &[&str]) -> Dataset {
        let schema = if columns.is_empty() {
            Schema::default_set()
        } else {
            Schema::from_keys(columns)
        };
        repo.create_dataset(name, &schema, None).unwrap()
    }

    // =========================================================================
    // Schema construction
    // =========================================================================

    #[test]
    fn schema_from_keys_trims_and_dedupes() {
        let schema = Schema::from_keys(["  A ", "", "B", "A", "  "]);
        let keys: Vec<_> = schema.keys().collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[test]
    fn default_set_has_unique_keys() {
        let schema = Schema::default_set();
        assert_eq!(schema.columns.len(), DEFAULT_COLUMNS.len());
        for (i, col) in schema.columns.iter().enumerate() {
            assert!(
                !schema.columns[..i].iter().any(|c| c.key == col.key),
                "duplicate default column {}",
                col.key
            );
            assert_eq!(col.ty, "string");
        }
    }

    // =========================================================================
    // Dataset operations
    // =========================================================================

    #[test]
    fn create_and_get_dataset() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A", "B"]);

        let loaded = repo.get_dataset(dataset.id).unwrap().unwrap();
        assert_eq!(loaded.name, "T");
        assert_eq!(loaded.schema.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert!(loaded.created_by_client.is_none());
    }

    #[test]
    fn get_missing_dataset_is_none() {
        let repo = test_repo();
        assert!(repo.get_dataset(42).unwrap().is_none());
    }

    #[test]
    fn list_datasets_by_client_filters() {
        let repo = test_repo();
        repo.create_dataset("mine", &Schema::default_set(), Some("client-1"))
            .unwrap();
        repo.create_dataset("other", &Schema::default_set(), Some("client-2"))
            .unwrap();
        repo.create_dataset("anon", &Schema::default_set(), None)
            .unwrap();

        assert_eq!(repo.list_datasets().unwrap().len(), 3);

        let mine = repo.list_datasets_by_client("client-1").unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "mine");
    }

    #[test]
    fn add_column_appends_and_rejects_duplicates() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);

        match repo.add_column(dataset.id, "B").unwrap() {
            AddColumnOutcome::Added(schema) => {
                assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["A", "B"]);
            }
            other => panic!("expected Added, got {:?}", other),
        }

        assert!(matches!(
            repo.add_column(dataset.id, "A").unwrap(),
            AddColumnOutcome::Duplicate
        ));

        // Duplicate attempt left the schema unchanged
        let loaded = repo.get_dataset(dataset.id).unwrap().unwrap();
        assert_eq!(loaded.schema.keys().collect::<Vec<_>>(), vec!["A", "B"]);

        assert!(matches!(
            repo.add_column(999, "C").unwrap(),
            AddColumnOutcome::DatasetMissing
        ));
    }

    #[test]
    fn add_column_is_case_sensitive() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        assert!(matches!(
            repo.add_column(dataset.id, "a").unwrap(),
            AddColumnOutcome::Added(_)
        ));
    }

    // =========================================================================
    // Row operations
    // =========================================================================

    #[test]
    fn upsert_without_id_creates() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);

        let outcome = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!(""))]))
            .unwrap();
        let UpsertOutcome::Created(row) = outcome else {
            panic!("expected Created");
        };
        assert_eq!(row.data["A"], json!(""));

        let (total, rows) = repo.list_rows(dataset.id, None, 0, 500).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, row.id);
    }

    #[test]
    fn upsert_with_existing_id_replaces_whole_mapping() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A", "B"]);

        let UpsertOutcome::Created(row) = repo
            .upsert_row(
                dataset.id,
                None,
                fields(&[("A", json!("1")), ("B", json!("2"))]),
            )
            .unwrap()
        else {
            panic!("expected Created");
        };

        // Full replace: B disappears, it is not merged
        let outcome = repo
            .upsert_row(dataset.id, Some(row.id), fields(&[("A", json!("x"))]))
            .unwrap();
        let UpsertOutcome::Replaced(replaced) = outcome else {
            panic!("expected Replaced");
        };
        assert_eq!(replaced.id, row.id);
        assert_eq!(replaced.data["A"], json!("x"));
        assert!(!replaced.data.contains_key("B"));

        let (total, rows) = repo.list_rows(dataset.id, None, 0, 500).unwrap();
        assert_eq!(total, 1);
        assert!(!rows[0].data.contains_key("B"));
    }

    #[test]
    fn upsert_with_unknown_id_creates_fresh_row() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);

        let outcome = repo
            .upsert_row(dataset.id, Some(9999), fields(&[("A", json!("v"))]))
            .unwrap();
        let UpsertOutcome::Created(row) = outcome else {
            panic!("expected Created");
        };
        // Store-assigned id, the client-supplied one is not honored
        assert_ne!(row.id, 9999);
    }

    #[test]
    fn patch_cell_changes_only_that_key() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A", "B"]);
        let UpsertOutcome::Created(row) = repo
            .upsert_row(
                dataset.id,
                None,
                fields(&[("A", json!("1")), ("B", json!("2"))]),
            )
            .unwrap()
        else {
            panic!("expected Created");
        };

        let patched = repo
            .patch_cell(dataset.id, row.id, "A", json!("x"))
            .unwrap()
            .unwrap();
        assert_eq!(patched.data["A"], json!("x"));
        assert_eq!(patched.data["B"], json!("2"));
        assert!(patched.updated_at >= row.updated_at);
    }

    #[test]
    fn patch_cell_is_idempotent() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let UpsertOutcome::Created(row) = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!(""))]))
            .unwrap()
        else {
            panic!("expected Created");
        };

        let first = repo
            .patch_cell(dataset.id, row.id, "A", json!("x"))
            .unwrap()
            .unwrap();
        let second = repo
            .patch_cell(dataset.id, row.id, "A", json!("x"))
            .unwrap()
            .unwrap();
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn patch_cell_missing_or_archived_is_none() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        assert!(
            repo.patch_cell(dataset.id, 123, "A", json!("x"))
                .unwrap()
                .is_none()
        );

        let UpsertOutcome::Created(row) = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!("1"))]))
            .unwrap()
        else {
            panic!("expected Created");
        };
        repo.archive_rows(dataset.id, &[row.id]).unwrap();
        assert!(
            repo.patch_cell(dataset.id, row.id, "A", json!("x"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn patch_cell_can_introduce_undeclared_key() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let UpsertOutcome::Created(row) = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!("1"))]))
            .unwrap()
        else {
            panic!("expected Created");
        };

        // Schema is advisory; a payload key outside it is accepted
        let patched = repo
            .patch_cell(dataset.id, row.id, "NOT_IN_SCHEMA", json!(7))
            .unwrap()
            .unwrap();
        assert_eq!(patched.data["NOT_IN_SCHEMA"], json!(7));
    }

    #[test]
    fn archive_is_idempotent() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let UpsertOutcome::Created(row) = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!("1"))]))
            .unwrap()
        else {
            panic!("expected Created");
        };

        assert_eq!(repo.archive_rows(dataset.id, &[row.id]).unwrap(), 1);
        assert_eq!(repo.archive_rows(dataset.id, &[row.id]).unwrap(), 0);
        assert_eq!(repo.archive_rows(dataset.id, &[9999]).unwrap(), 0);

        let (total, rows) = repo.list_rows(dataset.id, None, 0, 500).unwrap();
        assert_eq!(total, 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn list_rows_filters_case_insensitively() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        repo.upsert_row(dataset.id, None, fields(&[("A", json!("Hello World"))]))
            .unwrap();
        repo.upsert_row(dataset.id, None, fields(&[("A", json!("other"))]))
            .unwrap();

        let (total, rows) = repo.list_rows(dataset.id, Some("hello"), 0, 500).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].data["A"], json!("Hello World"));

        let (total, _) = repo.list_rows(dataset.id, Some("WORLD"), 0, 500).unwrap();
        assert_eq!(total, 1);

        let (total, _) = repo.list_rows(dataset.id, Some("absent"), 0, 500).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn list_rows_paginates_in_id_order() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["N"]);
        for i in 0..5 {
            repo.upsert_row(dataset.id, None, fields(&[("N", json!(i))]))
                .unwrap();
        }

        let (total, page) = repo.list_rows(dataset.id, None, 2, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].data["N"], json!(2));
        assert_eq!(page[1].data["N"], json!(3));
        assert!(page[0].id < page[1].id);
    }

    #[test]
    fn list_rows_clamps_limit() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["N"]);
        for i in 0..3 {
            repo.upsert_row(dataset.id, None, fields(&[("N", json!(i))]))
                .unwrap();
        }

        // limit below 1 is raised to 1
        let (_, page) = repo.list_rows(dataset.id, None, 0, 0).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn insert_rows_bulk_creates_all() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let created = repo
            .insert_rows(
                dataset.id,
                vec![
                    fields(&[("A", json!("1"))]),
                    fields(&[("A", json!("2"))]),
                ],
            )
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created[0].id < created[1].id);

        let (total, _) = repo.list_rows(dataset.id, None, 0, 500).unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn export_rows_excludes_archived() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let created = repo
            .insert_rows(
                dataset.id,
                vec![
                    fields(&[("A", json!("keep"))]),
                    fields(&[("A", json!("drop"))]),
                ],
            )
            .unwrap();
        repo.archive_rows(dataset.id, &[created[1].id]).unwrap();

        let exported = repo.export_rows(dataset.id).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].data["A"], json!("keep"));
    }

    #[test]
    fn row_mutation_touches_dataset() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        repo.upsert_row(dataset.id, None, fields(&[("A", json!("1"))]))
            .unwrap();

        let loaded = repo.get_dataset(dataset.id).unwrap().unwrap();
        assert!(loaded.updated_at >= dataset.updated_at);
    }

    #[test]
    fn row_api_json_includes_id() {
        let repo = test_repo();
        let dataset = create(&repo, "T", &["A"]);
        let UpsertOutcome::Created(row) = repo
            .upsert_row(dataset.id, None, fields(&[("A", json!("v"))]))
            .unwrap()
        else {
            panic!("expected Created");
        };

        let api = row.to_api_json();
        assert_eq!(api["A"], json!("v"));
        assert_eq!(api["id"], json!(row.id));
    }

    #[test]
    fn audit_insert_succeeds() {
        let repo = test_repo();
        repo.record_audit("create_dataset", json!({"dataset_id": 1}))
            .unwrap();
    }
}
