//! Synchronous trigger endpoint.
//!
//! `POST /tasks/:name` submits one invocation, waits a bounded time for its
//! record and answers with the result, the failure, or the last state seen.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taskline_client::Producer;
use taskline_core::{Kwargs, TaskArgs, TaskError, TaskFailure, TaskId, TaskState, TaskValue};
use tower_http::trace::TraceLayer;
use tracing::{instrument, warn};

pub struct AppState {
    pub producer: Arc<Producer>,
    /// Wait applied when the request names none
    pub default_timeout: Duration,
    /// Upper bound on a requested wait
    pub max_timeout: Duration,
}

impl AppState {
    pub fn new(producer: Arc<Producer>) -> Self {
        AppState {
            producer,
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
        }
    }

    fn timeout_for(&self, requested: Option<f64>) -> Result<Duration, ApiError> {
        let Some(secs) = requested else {
            return Ok(self.default_timeout);
        };
        Duration::try_from_secs_f64(secs)
            .map(|timeout| timeout.min(self.max_timeout))
            .map_err(|_| ApiError::BadRequest(format!("invalid timeout_secs: {}", secs)))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks/:name", post(trigger_task))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TriggerRequest {
    pub args: Vec<TaskValue>,
    pub kwargs: Kwargs,
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub id: TaskId,
    pub status: TaskState,
    pub response: TaskValue,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    eager: bool,
    tasks: Vec<String>,
}

#[instrument(skip(state, req))]
async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let timeout = state.timeout_for(req.timeout_secs)?;
    let handle = state
        .producer
        .delay(&name, TaskArgs::new(req.args, req.kwargs))
        .await?;

    let record = handle.wait(timeout).await?;
    match record.status {
        TaskState::Success => Ok(Json(TriggerResponse {
            id: record.id,
            status: record.status,
            response: record.result,
        })),
        _ => {
            let failure = record.failure().ok_or_else(|| {
                ApiError::Internal(format!("record for {} has no failure payload", record.id))
            })?;
            Err(ApiError::TaskFailed {
                id: record.id,
                failure,
            })
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        eager: state.producer.is_eager(),
        tasks: state.producer.registry().names(),
    })
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    TaskFailed { id: TaskId, failure: TaskFailure },
    Timeout {
        id: TaskId,
        waited: Duration,
        last_state: TaskState,
    },
    Unavailable(String),
    Internal(String),
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::UnknownTask(name) => ApiError::NotFound(format!("unknown task: {}", name)),
            TaskError::Serialization(_) | TaskError::ContentRejected(_) => {
                ApiError::BadRequest(err.to_string())
            }
            TaskError::TaskFailed { id, failure } => ApiError::TaskFailed { id, failure },
            TaskError::TaskTimeout {
                id,
                waited,
                last_state,
            } => ApiError::Timeout {
                id,
                waited,
                last_state,
            },
            TaskError::BrokerUnavailable(_) | TaskError::ResultStore(_) => {
                ApiError::Unavailable(err.to_string())
            }
            TaskError::DuplicateTask(_) | TaskError::Config(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            ApiError::TaskFailed { id, failure } => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "id": id,
                    "status": TaskState::Failure,
                    "error": failure,
                }),
            ),
            ApiError::Timeout {
                id,
                waited,
                last_state,
            } => {
                warn!("Gave up on {} after {:?} ({})", id, waited, last_state);
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    serde_json::json!({
                        "id": id,
                        "status": last_state,
                        "error": format!("no result after {:.3}s", waited.as_secs_f64()),
                    }),
                )
            }
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": msg }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
