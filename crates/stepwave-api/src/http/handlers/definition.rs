//! Step definition registry handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};

use stepwave_core::repository::workflow::WorkflowRepository;
use stepwave_types::workflow::StepDefinition;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/definitions - Register (or replace) a step definition.
///
/// Control expressions are parsed before anything is stored.
pub async fn register_definition(
    State(state): State<AppState>,
    Json(body): Json<StepDefinition>,
) -> Result<Json<ApiResponse<StepDefinition>>, AppError> {
    let start = Instant::now();
    state.engine.register_definition(&body).await?;

    let link = format!("/api/v1/definitions/{}", body.id);
    Ok(Json(ApiResponse::success(body, start).with_link("self", &link)))
}

/// GET /api/v1/definitions/{id} - Fetch a step definition.
pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StepDefinition>>, AppError> {
    let start = Instant::now();
    let def = state
        .engine
        .repository()
        .get_definition(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Step definition '{id}' not found")))?;

    Ok(Json(ApiResponse::success(def, start)))
}
