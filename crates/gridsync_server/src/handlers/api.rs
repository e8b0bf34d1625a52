use crate::db::{AddColumnOutcome, Dataset, Schema, UpsertOutcome, rfc3339};
use crate::error::ApiError;
use crate::handlers::AppState;
use crate::realtime::BroadcastMessage;
use crate::tabular;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::Query as ExtraQuery;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

/// Dataset detail response
#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    pub id: i64,
    pub name: String,
    pub schema: Schema,
    pub updated_at: String,
}

impl DatasetResponse {
    fn from_dataset(dataset: Dataset) -> Self {
        Self {
            id: dataset.id,
            name: dataset.name,
            schema: dataset.schema,
            updated_at: rfc3339(dataset.updated_at),
        }
    }
}

/// Dataset listing entry
#[derive(Debug, Serialize)]
pub struct DatasetSummaryResponse {
    pub id: i64,
    pub name: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct AllDatasetsResponse {
    pub all: Vec<DatasetSummaryResponse>,
}

#[derive(Debug, Serialize)]
pub struct RowsResponse {
    pub total: i64,
    pub rows: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct PatchResponse {
    pub ok: bool,
    pub applied: BroadcastMessage,
}

#[derive(Debug, Serialize)]
pub struct UpsertResponse {
    pub created: usize,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub schema: Schema,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub status: &'static str,
    pub rows_added: usize,
    pub schema: Schema,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub filename: String,
    pub content: Value,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_connections: usize,
    pub active_datasets: usize,
}

/// Create the dataset API routes
pub fn dataset_routes(state: AppState) -> Router {
    // Leave headroom for multipart framing so the explicit size check is
    // the one that rejects an oversized file
    let import_body_limit = DefaultBodyLimit::max(state.max_import_bytes + 64 * 1024);

    Router::new()
        .route("/datasets", post(create_dataset))
        .route("/datasets/all", get(list_all))
        .route("/datasets/mine-local", get(list_mine_local))
        .route("/datasets/{dataset_id}", get(get_dataset))
        .route(
            "/datasets/{dataset_id}/rows",
            get(list_rows).delete(delete_rows),
        )
        .route("/datasets/{dataset_id}/rows/patch", post(patch_cell))
        .route("/datasets/{dataset_id}/rows/upsert", post(upsert_rows))
        .route("/datasets/{dataset_id}/columns/add", post(add_column))
        .route(
            "/datasets/{dataset_id}/import",
            post(import_dataset).layer(import_body_limit),
        )
        .route("/datasets/{dataset_id}/export", get(export_dataset))
        .with_state(state)
}

/// Hand a committed mutation's event to the hub without coupling the
/// response to broadcast delivery.
fn dispatch_broadcast(state: &AppState, dataset_id: i64, message: BroadcastMessage) {
    let hub = state.hub.clone();
    tokio::spawn(async move {
        hub.broadcast(dataset_id, message).await;
    });
}

fn resolve_dataset(state: &AppState, dataset_id: i64) -> Result<Dataset, ApiError> {
    state
        .repo
        .get_dataset(dataset_id)?
        .ok_or(ApiError::NotFound("Dataset not found"))
}

/// GET / - Service index
pub async fn service_index() -> impl IntoResponse {
    Json(json!({
        "service": "gridsync-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /healthz - Health probe with hub occupancy
pub async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    Json(HealthResponse {
        status: "ok",
        active_connections: stats.active_connections,
        active_datasets: stats.active_datasets,
    })
}

#[derive(Debug, Deserialize)]
pub struct DatasetCreate {
    name: String,
    columns: Option<Vec<String>>,
    created_by_client: Option<String>,
}

/// POST /datasets - Create a dataset
async fn create_dataset(
    State(state): State<AppState>,
    Json(body): Json<DatasetCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Dataset name required"));
    }

    let mut schema = Schema::from_keys(body.columns.unwrap_or_default());
    if schema.is_empty() {
        schema = Schema::default_set();
    }

    let dataset = state
        .repo
        .create_dataset(name, &schema, body.created_by_client.as_deref())?;

    if let Err(err) = state
        .repo
        .record_audit("create_dataset", json!({"dataset_id": dataset.id}))
    {
        warn!("Audit write failed for dataset {}: {}", dataset.id, err);
    }

    Ok((
        StatusCode::CREATED,
        Json(DatasetResponse::from_dataset(dataset)),
    ))
}

/// GET /datasets/all - List every dataset
async fn list_all(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let all = state
        .repo
        .list_datasets()?
        .into_iter()
        .map(|d| DatasetSummaryResponse {
            id: d.id,
            name: d.name,
            updated_at: rfc3339(d.updated_at),
        })
        .collect();
    Ok(Json(AllDatasetsResponse { all }))
}

#[derive(Debug, Deserialize)]
pub struct MineLocalQuery {
    client_id: String,
}

/// GET /datasets/mine-local - List datasets created by an anonymous client
async fn list_mine_local(
    State(state): State<AppState>,
    Query(query): Query<MineLocalQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let datasets: Vec<_> = state
        .repo
        .list_datasets_by_client(&query.client_id)?
        .into_iter()
        .map(|d| DatasetSummaryResponse {
            id: d.id,
            name: d.name,
            updated_at: rfc3339(d.updated_at),
        })
        .collect();
    Ok(Json(datasets))
}

/// GET /datasets/{id} - Get dataset detail
async fn get_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let dataset = resolve_dataset(&state, dataset_id)?;
    Ok(Json(DatasetResponse::from_dataset(dataset)))
}

#[derive(Debug, Deserialize)]
pub struct ListRowsQuery {
    q: Option<String>,
    offset: Option<i64>,
    limit: Option<i64>,
}

/// GET /datasets/{id}/rows - List non-archived rows
async fn list_rows(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    Query(query): Query<ListRowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    resolve_dataset(&state, dataset_id)?;

    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must be non-negative"));
    }
    let limit = query.limit.unwrap_or(500);

    let (total, rows) = state
        .repo
        .list_rows(dataset_id, query.q.as_deref(), offset, limit)?;
    let rows = rows.iter().map(|r| r.to_api_json()).collect();
    Ok(Json(RowsResponse { total, rows }))
}

#[derive(Debug, Deserialize)]
pub struct CellPatch {
    id: i64,
    key: String,
    value: Value,
}

/// POST /datasets/{id}/rows/patch - Set a single cell
async fn patch_cell(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    Json(body): Json<CellPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .repo
        .patch_cell(dataset_id, body.id, &body.key, body.value.clone())?
        .ok_or(ApiError::NotFound("Row not found"))?;

    let message = BroadcastMessage::Cell {
        row_id: row.id,
        key: body.key,
        value: body.value,
        updated_at: rfc3339(row.updated_at),
    };
    dispatch_broadcast(&state, dataset_id, message.clone());

    Ok(Json(PatchResponse {
        ok: true,
        applied: message,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RowUpsert {
    rows: Vec<Map<String, Value>>,
}

/// POST /datasets/{id}/rows/upsert - Create rows, or fully replace the data
/// mapping of rows addressed by id
async fn upsert_rows(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    Json(body): Json<RowUpsert>,
) -> Result<impl IntoResponse, ApiError> {
    resolve_dataset(&state, dataset_id)?;

    let mut created = Vec::new();
    for mut item in body.rows {
        let id = item.remove("id").and_then(|v| v.as_i64());
        match state.repo.upsert_row(dataset_id, id, item)? {
            UpsertOutcome::Created(row) => created.push(row),
            UpsertOutcome::Replaced(_) => {}
        }
    }

    let count = created.len();
    if !created.is_empty() {
        let rows = created.iter().map(|r| r.to_api_json()).collect();
        dispatch_broadcast(&state, dataset_id, BroadcastMessage::RowsUpsert { rows });
    }

    Ok(Json(UpsertResponse { created: count }))
}

#[derive(Debug, Deserialize)]
pub struct ColumnAdd {
    key: String,
}

/// POST /datasets/{id}/columns/add - Append a schema column
async fn add_column(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    Json(body): Json<ColumnAdd>,
) -> Result<impl IntoResponse, ApiError> {
    let key = body.key.trim().to_string();
    if key.is_empty() {
        return Err(ApiError::validation("Column key required"));
    }

    let schema = match state.repo.add_column(dataset_id, &key)? {
        AddColumnOutcome::Added(schema) => schema,
        AddColumnOutcome::Duplicate => return Err(ApiError::Conflict("Column already exists")),
        AddColumnOutcome::DatasetMissing => return Err(ApiError::NotFound("Dataset not found")),
    };

    dispatch_broadcast(&state, dataset_id, BroadcastMessage::ColumnAdd { key });

    Ok(Json(SchemaResponse { schema }))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRowsQuery {
    #[serde(default)]
    ids: Vec<i64>,
}

/// DELETE /datasets/{id}/rows?ids=1&ids=2 - Archive rows (soft delete)
async fn delete_rows(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    ExtraQuery(query): ExtraQuery<ArchiveRowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.ids.is_empty() {
        return Err(ApiError::validation("Row ids required"));
    }
    resolve_dataset(&state, dataset_id)?;

    let deleted = state.repo.archive_rows(dataset_id, &query.ids)?;
    if deleted > 0 {
        dispatch_broadcast(
            &state,
            dataset_id,
            BroadcastMessage::DeleteRows { ids: query.ids },
        );
    }

    Ok(Json(DeleteResponse { deleted }))
}

/// POST /datasets/{id}/import - Bulk import from a csv or json upload
async fn import_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let dataset = resolve_dataset(&state, dataset_id)?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::validation("Invalid multipart body"))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_lowercase();
            let bytes = field
                .bytes()
                .await
                .map_err(|_| ApiError::validation("Invalid multipart body"))?;
            upload = Some((filename, bytes));
            break;
        }
    }
    let Some((filename, raw)) = upload else {
        return Err(ApiError::validation("file field required"));
    };

    if raw.is_empty() {
        return Err(ApiError::validation("Empty file"));
    }
    if raw.len() > state.max_import_bytes {
        return Err(ApiError::PayloadTooLarge("Import too large"));
    }

    let decoded = if filename.ends_with(".json") {
        tabular::decode_json(&raw)
    } else {
        tabular::decode_delimited(&String::from_utf8_lossy(&raw))
    };
    let data = decoded.map_err(|err| {
        warn!("Import parse failed for dataset {}: {}", dataset_id, err);
        ApiError::validation("Failed to parse import file")
    })?;

    // Observed policy: detected columns replace the schema wholesale
    let schema = if data.columns.is_empty() {
        dataset.schema
    } else {
        let schema = Schema::from_keys(&data.columns);
        state.repo.replace_schema(dataset_id, &schema)?;
        schema
    };

    let created = state.repo.insert_rows(dataset_id, data.rows)?;
    let rows_added = created.len();
    if !created.is_empty() {
        let rows = created.iter().map(|r| r.to_api_json()).collect();
        dispatch_broadcast(&state, dataset_id, BroadcastMessage::RowsUpsert { rows });
    }

    Ok(Json(ImportResponse {
        status: "ok",
        rows_added,
        schema,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    fmt: Option<String>,
}

/// GET /datasets/{id}/export - Export non-archived rows as json or csv
async fn export_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let fmt = query.fmt.as_deref().unwrap_or("json");
    if fmt != "json" && fmt != "csv" {
        return Err(ApiError::validation("fmt must be json or csv"));
    }

    let dataset = resolve_dataset(&state, dataset_id)?;
    let rows = state.repo.export_rows(dataset_id)?;

    let content = if fmt == "csv" {
        let columns: Vec<String> = dataset.schema.keys().map(String::from).collect();
        Value::String(tabular::write_csv(&columns, rows.iter().map(|r| &r.data)))
    } else {
        Value::Array(rows.iter().map(|r| r.to_api_json()).collect())
    };

    Ok(Json(ExportResponse {
        filename: format!("{}.{}", dataset.name, fmt),
        content,
    }))
}
