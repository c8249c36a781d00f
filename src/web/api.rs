use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::types::SummaryConfig;
use crate::storage::{
    AggregatePage, AggregateQuery, ClientName, FieldFilter, Storage, StorageError, StreamStats,
};
use crate::tail::{FetchError, FetchSummary, LeaseError, TailOrchestrator};

/// Shared state for the REST API
pub struct AppState {
    pub orchestrator: Arc<TailOrchestrator>,
    pub storage: Arc<dyn Storage>,
    pub summaries: BTreeMap<String, SummaryConfig>,
}

#[derive(Debug, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub description: Option<String>,
    pub destination: String,
    pub remote_files: Vec<String>,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub last_entry_timestamp: Option<String>,
    pub total_entries_fetched: u64,
}

#[derive(Debug, Serialize)]
pub struct FetchAllResponse {
    pub success: bool,
    pub results: Vec<FetchSummary>,
}

#[derive(Debug, Serialize)]
pub struct ClientRefreshResponse {
    pub stored: usize,
}

#[derive(Debug, Serialize)]
pub struct SummaryInfo {
    pub name: String,
    pub description: Option<String>,
    pub destination: String,
    pub group_by: Vec<String>,
}

/// Filters, bounds and paging applied to a named summary
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SummaryRequest {
    pub filters: Vec<FieldFilter>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub min_count: Option<i64>,
    pub max_count: Option<i64>,
    pub min_peak_daily_count: Option<i64>,
    pub max_peak_daily_count: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_asc: bool,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl SummaryRequest {
    fn into_query(self, summary: &SummaryConfig) -> AggregateQuery {
        let mut query = AggregateQuery::new(&summary.destination);
        query.group_by = summary.group_by.clone();
        query.sum_field = summary.sum_field.clone();
        query.filters = self.filters;
        query.from = self.from;
        query.to = self.to;
        query.min_count = self.min_count;
        query.max_count = self.max_count;
        query.min_peak_daily_count = self.min_peak_daily_count;
        query.max_peak_daily_count = self.max_peak_daily_count;
        query.sort_by = self.sort_by;
        query.sort_asc = self.sort_asc;
        if let Some(page) = self.page {
            query.page = page;
        }
        if let Some(page_size) = self.page_size {
            query.page_size = page_size;
        }
        query
    }
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/sources
pub async fn list_sources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SourceInfo>>, ApiError> {
    let mut sources = Vec::new();
    for (id, source) in state.orchestrator.sources() {
        let fetch_state = state
            .orchestrator
            .source_state(id)
            .await
            .map_err(|e| ApiError::InternalError(e.to_string()))?;

        sources.push(SourceInfo {
            id: id.clone(),
            description: source.description.clone(),
            destination: source.destination.clone(),
            remote_files: source.remote_files.clone(),
            last_fetch_time: fetch_state.last_fetch_time,
            last_entry_timestamp: fetch_state.last_entry_timestamp,
            total_entries_fetched: fetch_state.total_entries_fetched,
        });
    }
    Ok(Json(sources))
}

/// POST /api/fetch
pub async fn fetch_all(State(state): State<Arc<AppState>>) -> Json<FetchAllResponse> {
    let results: Vec<FetchSummary> = state
        .orchestrator
        .run_fetch_all()
        .await
        .into_iter()
        .map(|(source_id, result)| result.unwrap_or_else(|e| e.into_summary(&source_id)))
        .collect();

    Json(FetchAllResponse {
        success: results.iter().all(|r| r.success),
        results,
    })
}

/// POST /api/fetch/:source_id
pub async fn fetch_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Response {
    match state.orchestrator.run_fetch(&source_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(FetchError::UnknownSource(id)) => {
            ApiError::NotFound(format!("unknown source '{}'", id)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(e.into_summary(&source_id)),
        )
            .into_response(),
    }
}

/// POST /api/query
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(query): Json<AggregateQuery>,
) -> Result<Json<AggregatePage>, ApiError> {
    let page = state.storage.aggregate(&query).await?;
    Ok(Json(page))
}

/// GET /api/summaries
pub async fn list_summaries(State(state): State<Arc<AppState>>) -> Json<Vec<SummaryInfo>> {
    Json(
        state
            .summaries
            .iter()
            .map(|(name, summary)| SummaryInfo {
                name: name.clone(),
                description: summary.description.clone(),
                destination: summary.destination.clone(),
                group_by: summary.group_by.clone(),
            })
            .collect(),
    )
}

/// POST /api/summaries/:name
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SummaryRequest>,
) -> Result<Json<AggregatePage>, ApiError> {
    let summary = state
        .summaries
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown summary '{}'", name)))?;

    let page = state.storage.aggregate(&request.into_query(summary)).await?;
    Ok(Json(page))
}

/// GET /api/clients
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ClientName>>, ApiError> {
    Ok(Json(state.storage.client_names().await?))
}

/// POST /api/clients/refresh
pub async fn refresh_clients(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClientRefreshResponse>, ApiError> {
    let stored = state.orchestrator.refresh_client_names().await?;
    Ok(Json(ClientRefreshResponse { stored }))
}

/// GET /api/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StreamStats>>, ApiError> {
    Ok(Json(state.storage.stats().await?))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidQuery(msg) => ApiError::BadRequest(msg),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::NotConfigured => ApiError::NotFound(e.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
