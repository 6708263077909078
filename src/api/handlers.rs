use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::AppState;
use crate::error::{AppError, Result};
use crate::search::{IndexInfo, SearchRequest};
use crate::syncstate::SyncStatus;

/// Liveness probe; always healthy while the process serves requests
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HashMap<String, String>,
}

/// Readiness probe: the engine must be able to list indexes, and every
/// configured index must exist.
pub async fn ready(
    State(state): State<AppState>,
) -> std::result::Result<Json<ReadyResponse>, (StatusCode, String)> {
    let shards = state.engine.list_indexes().await;

    if !state.config.indexes.is_empty() && shards.is_empty() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "no indexes available".to_string(),
        ));
    }

    let mut checks = HashMap::new();
    checks.insert("searchEngine".to_string(), "ok".to_string());
    checks.insert("indexerService".to_string(), "ok".to_string());
    checks.insert("indexes".to_string(), "ok".to_string());

    Ok(Json(ReadyResponse {
        status: "ready".to_string(),
        checks,
    }))
}

/// Aggregate the engine's per-shard listing into logical index infos,
/// enriched with sync status. Physical shard names stay private.
async fn logical_index_infos(state: &AppState) -> Vec<IndexInfo> {
    let sync_states = state.indexer.sync_states();
    let mut infos = Vec::with_capacity(state.config.indexes.len());

    for index in &state.config.indexes {
        let doc_count = state.engine.doc_count(&index.name).await.unwrap_or(0);
        let collection_key = index.collection_key(&state.config.mongodb.database);

        let (status, progress) = match sync_states.get(&collection_key) {
            Some(sync) if sync.sync_status == SyncStatus::InProgress => {
                ("syncing".to_string(), Some(sync.progress.clone()))
            }
            _ => ("active".to_string(), None),
        };

        infos.push(IndexInfo {
            name: index.name.clone(),
            doc_count,
            status,
            last_sync: state.engine.last_sync(&index.name),
            sync_progress: progress,
        });
    }

    infos
}

/// `GET /indexes`
pub async fn list_indexes(State(state): State<AppState>) -> Json<Value> {
    let indexes = logical_index_infos(&state).await;
    let total = indexes.len();
    Json(json!({ "indexes": indexes, "total": total }))
}

/// `GET /indexes/{index}/status`
pub async fn index_status(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<Value>> {
    let infos = logical_index_infos(&state).await;
    let info = infos
        .into_iter()
        .find(|info| info.name == index)
        .ok_or_else(|| AppError::NotFound(format!("index {}", index)))?;

    Ok(Json(json!({
        "service": "open-atlas-search",
        "status": "running",
        "index": info,
    })))
}

/// `GET /indexes/{index}/mapping`
pub async fn index_mapping(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<Value>> {
    let cfg = state
        .engine
        .index_config(&index)
        .await
        .ok_or_else(|| AppError::NotFound(format!("index {}", index)))?;

    Ok(Json(serde_json::to_value(&cfg.definition)?))
}

/// `POST /indexes/{index}/search`
pub async fn search(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Json(mut request): Json<SearchRequest>,
) -> Result<Json<Value>> {
    request.index = index;
    let response = state.router.search(request).await?;
    Ok(Json(serde_json::to_value(&response)?))
}
