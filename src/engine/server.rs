//! HTTP front-end of the coordinator's engine

use crate::engine::error::EngineError;
use crate::engine::messages::{
    CompleteTaskRequest, ErrorCode, ErrorResponse, ExecutionResult, HealthResponse,
    PollTaskRequest, ResultQuery, ScheduleActivityRequest, ScheduleActivityResponse,
    StartWorkflowRequest, StartWorkflowResponse, Task,
};
use crate::engine::state::ExecutionKind;
use crate::engine::store::Engine;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use slog::{debug, info, Logger};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Serves the engine API over HTTP/JSON
#[derive(Clone)]
pub struct EngineServer {
    engine: Arc<Engine>,
    identity: String,
    cluster_id: Uuid,
    logger: Logger,
}

impl EngineServer {
    pub fn new(engine: Arc<Engine>, identity: String, cluster_id: Uuid, logger: Logger) -> Self {
        Self {
            engine,
            identity,
            cluster_id,
            logger,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/workflows", post(handle_start_workflow))
            .route("/workflows/result", get(handle_workflow_result))
            .route("/activities", post(handle_schedule_activity))
            .route("/activities/result", get(handle_activity_result))
            .route("/tasks/poll", post(handle_poll_task))
            .route("/tasks/complete", post(handle_complete_task))
            .with_state(self.clone())
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let app = self.router();
        info!(self.logger, "Engine API routes configured");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            ErrorCode::AlreadyStarted | ErrorCode::AlreadyClosed => StatusCode::CONFLICT,
            ErrorCode::InvalidTaskQueue | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorResponse {
            code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn handle_health(State(server): State<EngineServer>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        identity: server.identity.clone(),
        cluster_id: server.cluster_id,
    })
}

async fn handle_start_workflow(
    State(server): State<EngineServer>,
    Json(req): Json<StartWorkflowRequest>,
) -> Result<Json<StartWorkflowResponse>, EngineError> {
    debug!(server.logger, "Start workflow request";
        "workflow_id" => &req.workflow_id,
        "workflow_type" => &req.workflow_type
    );
    server.engine.start_workflow(req).map(Json)
}

async fn handle_workflow_result(
    State(server): State<EngineServer>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ExecutionResult>, EngineError> {
    server
        .engine
        .await_result(ExecutionKind::Workflow, query)
        .await
        .map(Json)
}

async fn handle_schedule_activity(
    State(server): State<EngineServer>,
    Json(req): Json<ScheduleActivityRequest>,
) -> Result<Json<ScheduleActivityResponse>, EngineError> {
    server.engine.schedule_activity(req).map(Json)
}

async fn handle_activity_result(
    State(server): State<EngineServer>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ExecutionResult>, EngineError> {
    server
        .engine
        .await_result(ExecutionKind::Activity, query)
        .await
        .map(Json)
}

async fn handle_poll_task(
    State(server): State<EngineServer>,
    Json(req): Json<PollTaskRequest>,
) -> Result<Json<Option<Task>>, EngineError> {
    server.engine.poll_task(req).await.map(Json)
}

async fn handle_complete_task(
    State(server): State<EngineServer>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<StatusCode, EngineError> {
    server.engine.complete_task(req)?;
    Ok(StatusCode::NO_CONTENT)
}
