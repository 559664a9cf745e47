use crate::batch::BatchRunner;
use crate::cache::OfferCache;
use crate::config::Config;
use crate::errors::AppError;
use crate::flow::FlowEngine;
use crate::models::{CacheEntry, FlowReport, FlowRequest, SaveOfferRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// The end-to-end flow coordinator.
    pub engine: Arc<FlowEngine>,
    /// Approved-offer cache.
    pub cache: Arc<OfferCache>,
    /// Batch runner over CRM pipelines.
    pub batch: Arc<BatchRunner>,
}

fn valid_cpf(cpf: &str) -> bool {
    cpf.len() == 11 && cpf.chars().all(|c| c.is_ascii_digit())
}

/// Health check endpoint.
///
/// Reports service liveness plus cached entry counts grouped by status.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let counts = state.cache.status_counts().await;
    let total: usize = counts.values().sum();

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "consig-flow-api",
            "version": "0.1.0",
            "cache": {
                "total": total,
                "byStatus": counts,
            },
        })),
    )
}

/// POST /flow/run
///
/// Runs the end-to-end flow for one CPF. The flow itself executes in a
/// spawned task: a caller disconnect or the request-level timeout firing
/// does not cancel in-flight upstream work, which still completes and is
/// cached.
pub async fn run_flow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FlowRequest>,
) -> Response {
    if !valid_cpf(&request.cpf) {
        return AppError::BadRequest("CPF must be 11 numeric digits".to_string()).into_response();
    }

    tracing::info!("POST /flow/run - CPF: {}", request.cpf);

    let engine = state.engine.clone();
    let work = tokio::spawn(async move { engine.execute(request).await });

    match tokio::time::timeout(state.config.request_timeout, work).await {
        Err(_) => {
            // Request budget exceeded; the spawned flow keeps running.
            tracing::error!("Flow exceeded the request-level timeout");
            (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({
                    "success": false,
                    "error": "Processing exceeded the request timeout",
                })),
            )
                .into_response()
        }
        Ok(Err(join_error)) => {
            tracing::error!("Flow task failed: {}", join_error);
            AppError::InternalError("Flow task failed".to_string()).into_response()
        }
        Ok(Ok(report)) => flow_response(report),
    }
}

fn flow_response(report: FlowReport) -> Response {
    let status = match &report.failure {
        None => StatusCode::OK,
        Some(failure) => failure.http_status(),
    };
    (status, Json(report)).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub cpf: String,
}

/// POST /crm/sync
///
/// Best-effort write-back of a cached outcome into the CRM pipeline. The
/// result never affects the stored entry.
pub async fn sync_crm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Value>, AppError> {
    if !valid_cpf(&request.cpf) {
        return Err(AppError::BadRequest(
            "CPF must be 11 numeric digits".to_string(),
        ));
    }

    let entry = state.cache.read(&request.cpf).await.ok_or_else(|| {
        AppError::NotFound(format!("No cache entry for CPF {}", request.cpf))
    })?;

    let report = state.engine.sync_to_crm(&entry).await;
    Ok(Json(json!({ "sync": report })))
}

/// GET /cache/:cpf
pub async fn get_cached_offer(
    State(state): State<Arc<AppState>>,
    Path(cpf): Path<String>,
) -> Result<Json<CacheEntry>, AppError> {
    state
        .cache
        .read(&cpf)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No cache entry for CPF {}", cpf)))
}

/// GET /cache
pub async fn list_cached_offers(
    State(state): State<Arc<AppState>>,
) -> Json<Value> {
    let entries = state.cache.list().await;
    Json(json!({
        "total": entries.len(),
        "entries": entries,
    }))
}

/// POST /cache
pub async fn save_cached_offer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveOfferRequest>,
) -> Result<(StatusCode, Json<CacheEntry>), AppError> {
    if !valid_cpf(&request.cpf) {
        return Err(AppError::BadRequest(
            "CPF must be 11 numeric digits".to_string(),
        ));
    }

    let entry = state
        .cache
        .upsert(
            &request.cpf,
            &request.consent_term_id,
            request.simulation,
            request.customer,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(entry)))
}

/// PUT /cache/:cpf
pub async fn update_cached_offer(
    State(state): State<Arc<AppState>>,
    Path(cpf): Path<String>,
    Json(partial): Json<Value>,
) -> Result<Json<CacheEntry>, AppError> {
    state.cache.update(&cpf, partial).await.map(Json)
}

/// DELETE /cache/:cpf
pub async fn delete_cached_offer(
    State(state): State<Arc<AppState>>,
    Path(cpf): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.cache.delete(&cpf).await?;
    Ok(Json(json!({ "deleted": cpf })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub pipeline_id: Option<i64>,
}

/// POST /batch/run
pub async fn start_batch(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<BatchRequest>>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let pipeline_id = payload
        .and_then(|Json(p)| p.pipeline_id)
        .unwrap_or_else(|| state.config.crm_lookup_pipelines.first().copied().unwrap_or(1));

    let queued = state.batch.start(pipeline_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "queued": queued, "pipelineId": pipeline_id })),
    ))
}

/// POST /batch/pause
pub async fn pause_batch(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.batch.pause();
    Json(json!({ "paused": true }))
}

/// POST /batch/resume
pub async fn resume_batch(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.batch.resume();
    Json(json!({ "paused": false }))
}

/// GET /batch/status
pub async fn batch_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "batch": state.batch.status() }))
}
