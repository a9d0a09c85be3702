use crate::error::AppError;
use crate::models::history::{self, HistoryEntry, HistoryKind};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_history).delete(clear_history))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub kind: Option<HistoryKind>,
    pub limit: Option<usize>,
}

async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let limit = query.limit.unwrap_or(50);
    let store = state.store.clone();
    let entries = tokio::task::spawn_blocking(move || match query.kind {
        Some(kind) => history::list(&store, kind).map(|mut entries| {
            entries.truncate(limit);
            entries
        }),
        None => history::list_all(&store, limit),
    })
    .await??;
    Ok(Json(entries))
}

async fn clear_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || history::clear(&store, query.kind)).await??;
    tracing::info!(kind = ?query.kind, "History cleared");
    Ok(Json(serde_json::json!({ "cleared": true })))
}
