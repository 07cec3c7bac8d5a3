use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::api::dto::{ScheduleRequest, ScheduleResponse};
use crate::app_state::AppState;
use crate::core::datastore::{ModelServer, PodSnapshot};
use crate::errors::RouterError;

/// Admin/demonstration HTTP surface (SPEC_FULL.md §4.12). This exercises
/// the live scheduling framework directly; it is not the production
/// request-proxying front end, which lives outside this crate.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/model-servers", get(list_model_servers))
        .route("/model-servers/:namespace/:name/pods", get(pods_for_model_server))
        .route("/pods/:namespace/:name", get(get_pod))
        .route("/schedule", post(schedule))
}

async fn list_model_servers(State(state): State<AppState>) -> Json<Vec<ModelServer>> {
    Json(state.datastore.list_model_servers())
}

async fn pods_for_model_server(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Vec<PodSnapshot>>, RouterError> {
    state
        .datastore
        .get_pods_by_model_server(&namespace, &name)
        .map(Json)
        .ok_or_else(|| RouterError::NotFound(format!("model-server {namespace}/{name}")))
}

async fn get_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<PodSnapshot>, RouterError> {
    let key = crate::core::datastore::key_str(&namespace, &name);
    state
        .datastore
        .get_pod(&key)
        .map(Json)
        .ok_or_else(|| RouterError::NotFound(format!("pod {key}")))
}

async fn schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, RouterError> {
    if req.model.is_empty() {
        return Err(RouterError::InvalidInput("model must not be empty".into()));
    }
    let request_id = req.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    let decision = state
        .schedule(&req.model, req.prompt.into(), &req.user_id, &request_id)
        .await
        .map_err(|e| RouterError::DependencyUnavailable(e.to_string()))?;

    Ok(Json(ScheduleResponse {
        decode_pod: decision.decode_pod,
        prefill_pod: decision.prefill_pod,
    }))
}
