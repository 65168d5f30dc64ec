//! HTTP surface. Handlers stay thin: decode, call the engine or store, map
//! errors to status codes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::engine::SubmitOutcome;
use crate::server::AppState;
use crate::Error;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/definitions", post(deploy_definition).get(list_definitions))
        .route("/definitions/{id}", get(get_definition))
        .route(
            "/definitions/{id}/instances",
            post(create_instance).get(list_instances),
        )
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/step", post(step_instance))
        .route("/instances/{id}/task", get(get_current_task))
        .route("/instances/{id}/task/{activity_id}", post(submit_task))
        .route("/instances/{id}/navigate/start", post(navigate_to_start))
        .route(
            "/instances/{id}/navigate/next-pending",
            post(navigate_to_next_pending),
        )
        .route("/instances/{id}/rerun", post(rerun_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::DefinitionNotFound(_) | Error::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::SerdeJson(_) => StatusCode::BAD_REQUEST,
            Error::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => {
                error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn deploy_definition(
    State(state): State<AppState>,
    Json(document): Json<JsonValue>,
) -> ApiResult<impl IntoResponse> {
    let definition = state.engine.deploy_definition(document).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

async fn list_definitions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let definitions = state.store.list_definitions().await?;
    Ok(Json(definitions))
}

async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_definition(&id)
        .await?
        .ok_or(Error::DefinitionNotFound(id))?;
    Ok(Json(definition))
}

async fn create_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.engine.create_instance(&id).await?;
    let snapshot = state.engine.instance_snapshot(instance.id).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn list_instances(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_definition(&id)
        .await?
        .ok_or(Error::DefinitionNotFound(id))?;
    let instances = state.store.list_instances(&definition.id).await?;
    let snapshots: Vec<JsonValue> = instances
        .iter()
        .map(|instance| instance.snapshot(&definition))
        .collect();
    Ok(Json(snapshots))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.engine.instance_snapshot(id).await?;
    Ok(Json(snapshot))
}

async fn step_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.engine.step(id).await?;
    Ok(Json(outcome))
}

async fn get_current_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.get_current_task(id).await?;
    Ok(Json(json!({ "task": task })))
}

async fn submit_task(
    State(state): State<AppState>,
    Path((id, activity_id)): Path<(Uuid, String)>,
    Json(values): Json<HashMap<String, JsonValue>>,
) -> ApiResult<impl IntoResponse> {
    match state.engine.submit_task(id, &activity_id, &values).await? {
        SubmitOutcome::Accepted => Ok((
            StatusCode::OK,
            Json(json!({ "accepted": true, "errors": [] })),
        )),
        SubmitOutcome::Rejected { errors } => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "accepted": false, "errors": errors })),
        )),
    }
}

async fn navigate_to_start(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.engine.navigate_to_start(id).await?;
    Ok(Json(outcome))
}

async fn navigate_to_next_pending(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.engine.navigate_to_next_pending(id).await?;
    Ok(Json(outcome))
}

async fn rerun_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.engine.rerun(id).await?;
    let snapshot = state.engine.instance_snapshot(instance.id).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}
