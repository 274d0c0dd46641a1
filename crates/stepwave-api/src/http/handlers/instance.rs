//! Workflow instance handlers: create and inspect.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use stepwave_types::workflow::{InstanceSnapshot, WorkflowTemplate};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/instances`.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub template: WorkflowTemplate,
    /// Caller context merged over the template's `internal_json`.
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CreatedInstance {
    pub instance_id: Uuid,
}

/// POST /api/v1/instances - Create an instance and start its first wave.
pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<Json<ApiResponse<CreatedInstance>>, AppError> {
    let start = Instant::now();
    let instance_id = state
        .engine
        .create_instance(&body.template, body.context)
        .await?;

    let base = format!("/api/v1/instances/{instance_id}");
    let resp = ApiResponse::success(CreatedInstance { instance_id }, start)
        .with_link("self", &base)
        .with_link("stream", &format!("{base}/stream"));
    Ok(Json(resp))
}

/// GET /api/v1/instances/{id} - Instance record plus all step entries.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let start = Instant::now();
    let snapshot = state.engine.get_instance_status(&id).await?;
    Ok(Json(ApiResponse::success(snapshot, start)))
}
