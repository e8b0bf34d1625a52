use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event pushed to live subscribers of a dataset.
///
/// Transient and best-effort: never persisted, no delivery guarantee beyond
/// the connections that are alive when it is sent. Clients treat each
/// message as an idempotent statement of new state for the referenced
/// key/row, not a delta: broadcasts for concurrent mutations may arrive
/// out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// A single cell changed
    Cell {
        row_id: i64,
        key: String,
        value: Value,
        updated_at: String,
    },
    /// New rows were created (upsert or bulk import)
    RowsUpsert { rows: Vec<Value> },
    /// A column was appended to the schema
    ColumnAdd { key: String },
    /// Rows were archived
    DeleteRows { ids: Vec<i64> },
}
