use std::path::PathBuf;

use axum::{
    Router,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use common::constants::DEFAULT_FILE_SIZE;
use common::error::{StoreError, StoreResult};
use common::schemas::{CreateQuery, RebalanceQuery, RetrieveQuery};

use crate::core::catalog::FileEntry;
use crate::core::node::Priority;
use crate::core::rebalance::RebalanceReport;
use crate::core::state::{ClusterStats, CoordinatorState};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    #[serde(flatten)]
    pub entry: FileEntry,
}

pub fn router(state: CoordinatorState) -> Router {
    Router::new()
        .route(
            "/files/{*name}",
            get(get_file).put(create_file).delete(delete_file),
        )
        .route("/files", get(list_files))
        .route("/retrieve/{*name}", post(retrieve_file))
        .route("/admin/stats", get(stats))
        .route("/admin/rebalance", post(rebalance))
        .with_state(state)
}

/// Runs engine work off the async runtime.
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Any(e.into()))?
}

// PUT /files/{name}
#[tracing::instrument(name = "coord.create", skip(ctx, q))]
pub async fn create_file(
    Path(name): Path<String>,
    State(ctx): State<CoordinatorState>,
    Query(q): Query<CreateQuery>,
) -> Result<(StatusCode, Json<FileEntry>), StoreError> {
    let priority = match q.priority {
        Some(p) => Priority::try_from(p)?,
        None => Priority::Low,
    };
    let size = q.size.unwrap_or(DEFAULT_FILE_SIZE);
    let entry = blocking(move || ctx.create(&name, size, priority, q.node)).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// GET /files/{name}
pub async fn get_file(
    Path(name): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<Json<FileEntry>, StoreError> {
    ctx.get(&name).map(Json).ok_or(StoreError::NotFound(name))
}

// DELETE /files/{name}
#[tracing::instrument(name = "coord.delete", skip(ctx))]
pub async fn delete_file(
    Path(name): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<StatusCode, StoreError> {
    blocking(move || ctx.delete(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /retrieve/{name}?dest=
#[tracing::instrument(name = "coord.retrieve", skip(ctx, q))]
pub async fn retrieve_file(
    Path(name): Path<String>,
    State(ctx): State<CoordinatorState>,
    Query(q): Query<RetrieveQuery>,
) -> Result<StatusCode, StoreError> {
    let dest = PathBuf::from(q.dest);
    blocking(move || ctx.retrieve(&name, &dest)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /files
pub async fn list_files(State(ctx): State<CoordinatorState>) -> Json<Vec<FileRecord>> {
    let files = ctx
        .list()
        .into_iter()
        .map(|(name, entry)| FileRecord { name, entry })
        .collect();
    Json(files)
}

// GET /admin/stats
pub async fn stats(State(ctx): State<CoordinatorState>) -> Result<Json<ClusterStats>, StoreError> {
    Ok(Json(ctx.stats()?))
}

// POST /admin/rebalance?if_needed=
/// Responds `204` when `if_needed` is set and the cluster is below threshold.
#[tracing::instrument(name = "coord.rebalance", skip(ctx))]
pub async fn rebalance(
    State(ctx): State<CoordinatorState>,
    Query(q): Query<RebalanceQuery>,
) -> Result<Response, StoreError> {
    let report = blocking(move || {
        if q.if_needed {
            ctx.rebalance_if_needed()
        } else {
            ctx.rebalance().map(Some)
        }
    })
    .await?;
    Ok(match report {
        Some(report) => Json::<RebalanceReport>(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
