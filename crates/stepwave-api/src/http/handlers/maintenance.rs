//! Operator endpoints: recovery and heartbeat health scans on demand.

use std::time::Instant;

use axum::Json;
use axum::extract::State;

use stepwave_core::workflow::{HealthReport, RecoveryReport};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/maintenance/recover - Re-adopt running instances.
pub async fn recover(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RecoveryReport>>, AppError> {
    let start = Instant::now();
    let report = state.engine.recover_running_instances().await?;
    Ok(Json(ApiResponse::success(report, start)))
}

/// POST /api/v1/maintenance/health - Reset stale steps and revive instances.
pub async fn health_scan(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<HealthReport>>, AppError> {
    let start = Instant::now();
    let report = state.engine.check_heartbeat_health().await?;
    Ok(Json(ApiResponse::success(report, start)))
}
