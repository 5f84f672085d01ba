//! Superfície HTTP do serviço de sincronização
//!
//! Rotas expostas:
//! - `POST /api/sync/google-sheets/analyze` — fase de análise, sem mutações
//! - `POST /api/sync/google-sheets/apply` — fase de aplicação
//! - `GET /api/sync/timestamp/:ambulatorio` — carimbo da última sincronização
//! - `GET /api/sync/manual-edits/:ambulatorio` — trilha de edições manuais
//! - `GET /api/sync/backup/:ambulatorio` — retrato disponível para rollback
//! - `POST /api/sync/rollback/:ambulatorio` — desfaz a última aplicação
//! - `GET /api/health` — sonda de saúde com versão de build

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use validator::Validate;

use common_db::models::{ManualEdit, Period, SyncBackupInfo, SyncTimestamp};
use common_db::DbError;

use crate::built_info;
use crate::error::SyncError;
use crate::session::{
    AnalyzeResult, ApplyResult, ConflictChoice, RollbackResult, SyncCoordinator,
};

/// Monta o roteador do serviço
pub fn router(coordinator: Arc<SyncCoordinator>) -> Router {
    Router::new()
        .route("/api/sync/google-sheets/analyze", post(analyze))
        .route("/api/sync/google-sheets/apply", post(apply))
        .route("/api/sync/timestamp/:ambulatorio", get(sync_timestamp))
        .route("/api/sync/manual-edits/:ambulatorio", get(manual_edits))
        .route("/api/sync/backup/:ambulatorio", get(sync_backup))
        .route("/api/sync/rollback/:ambulatorio", post(rollback))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(ConcurrencyLimitLayer::new(64))
        .with_state(coordinator)
}

/// Pedido da fase de análise
#[derive(Debug, Deserialize, Validate)]
pub struct AnalyzeRequest {
    #[validate(length(min = 1))]
    pub ambulatorio: String,
    #[validate(range(min = 2000, max = 2100))]
    pub anno: i32,
    #[validate(range(min = 1, max = 12))]
    pub mese: u32,
}

/// Pedido da fase de aplicação
#[derive(Debug, Deserialize, Validate)]
pub struct ApplyRequest {
    #[validate(length(min = 1))]
    pub ambulatorio: String,
    #[validate(range(min = 2000, max = 2100))]
    pub anno: i32,
    #[validate(range(min = 1, max = 12))]
    pub mese: u32,
    /// Escolha do usuário por identificador de conflito; conflitos ausentes
    /// ficam intocados
    #[serde(default)]
    pub conflict_actions: HashMap<String, ConflictChoice>,
    /// Quem está executando a sincronização
    #[serde(default = "default_operator")]
    pub operator: String,
}

fn default_operator() -> String {
    "sheet-bridge".to_string()
}

/// Carimbo de sincronização com variante explícita para "nunca sincronizado"
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TimestampResponse {
    Synced {
        #[serde(flatten)]
        timestamp: SyncTimestamp,
    },
    NeverSynced,
}

async fn analyze(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResult>, ApiError> {
    req.validate()?;
    let period = Period::new(req.anno, req.mese);
    let result = coordinator.analyze(&req.ambulatorio, &period).await?;
    Ok(Json(result))
}

async fn apply(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<ApplyResult>, ApiError> {
    req.validate()?;
    let period = Period::new(req.anno, req.mese);
    let result = coordinator
        .apply(&req.ambulatorio, &period, &req.conflict_actions, &req.operator)
        .await?;
    Ok(Json(result))
}

async fn sync_timestamp(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Path(ambulatorio): Path<String>,
) -> Result<Json<TimestampResponse>, ApiError> {
    let response = match coordinator.sync_timestamp(&ambulatorio).await? {
        Some(timestamp) => TimestampResponse::Synced { timestamp },
        None => TimestampResponse::NeverSynced,
    };
    Ok(Json(response))
}

async fn manual_edits(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Path(ambulatorio): Path<String>,
) -> Result<Json<Vec<ManualEdit>>, ApiError> {
    Ok(Json(coordinator.manual_edits(&ambulatorio).await?))
}

/// Retrato disponível para rollback, no formato consumido pela agenda
#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub has_backup: bool,
    #[serde(flatten)]
    pub info: Option<SyncBackupInfo>,
}

async fn sync_backup(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Path(ambulatorio): Path<String>,
) -> Result<Json<BackupResponse>, ApiError> {
    let info = coordinator.sync_backup(&ambulatorio).await?;
    Ok(Json(BackupResponse {
        has_backup: info.is_some(),
        info,
    }))
}

async fn rollback(
    State(coordinator): State<Arc<SyncCoordinator>>,
    Path(ambulatorio): Path<String>,
) -> Result<Json<RollbackResult>, ApiError> {
    Ok(Json(coordinator.rollback(&ambulatorio).await?))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": built_info::PKG_NAME,
        "version": built_info::PKG_VERSION,
    }))
}

/// Erros da camada HTTP, com mapeamento de status por categoria
#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    Validation(String),
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::Sync(e)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            ApiError::Sync(e) => {
                let status = match e {
                    SyncError::SessionBusy(_) => StatusCode::CONFLICT,
                    SyncError::SheetUnavailable(_) => StatusCode::BAD_GATEWAY,
                    SyncError::Storage(DbError::NotFound(_)) => StatusCode::NOT_FOUND,
                    SyncError::DataIntegrity(_) | SyncError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));
        (status, body).into_response()
    }
}
