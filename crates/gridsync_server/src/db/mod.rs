mod repo;
mod schema;

pub use repo::{
    AddColumnOutcome, ColumnDef, DEFAULT_COLUMNS, Dataset, DatasetRepo, DatasetSummary, Row,
    Schema, UpsertOutcome, rfc3339,
};
pub use schema::init_database;
