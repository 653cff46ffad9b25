// Admin HTTP handlers

use std::collections::VecDeque;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::activity::{ActivityLog, ActivitySummary, LoggedMessage};
use crate::agent::{AgentInstance, AgentPool};
use crate::WarrenError;

/// Shared handler state
#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<AgentPool>,
    pub activity: Arc<ActivityLog>,
}

impl AdminState {
    fn agent(&self, id: &str) -> Result<&Arc<AgentInstance>, ApiError> {
        Ok(self.pool.require(id)?)
    }
}

/// Builds the admin router without CORS or a listener, so tests can drive
/// it directly.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/config", get(config_handler))
        .route("/agent/options/:id", get(options_handler))
        .route("/agent/options/schema/:id", get(schema_handler))
        .route("/agent/options/update/:id", post(update_options_handler))
        .route("/agent/state/:id", get(state_handler))
        .route("/agent/message-log/:id", get(message_log_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct AgentLinks {
    pub options: String,
    pub schema: String,
    pub update: String,
    pub state: String,
    pub message_log: String,
}

impl AgentLinks {
    fn for_agent(id: &str) -> Self {
        Self {
            options: format!("/agent/options/{}", id),
            schema: format!("/agent/options/schema/{}", id),
            update: format!("/agent/options/update/{}", id),
            state: format!("/agent/state/{}", id),
            message_log: format!("/agent/message-log/{}", id),
        }
    }
}

/// One row of `GET /config`.
#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub sources: Vec<String>,
    pub capabilities: Vec<&'static str>,
    pub check_interval_ms: Option<u64>,
    pub options: Value,
    pub activity: ActivitySummary,
    pub links: AgentLinks,
}

#[derive(Debug, Serialize)]
struct MessageLogView {
    id: String,
    incoming: VecDeque<LoggedMessage>,
    outgoing: VecDeque<LoggedMessage>,
}

struct ApiError(WarrenError);

impl From<WarrenError> for ApiError {
    fn from(e: WarrenError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WarrenError::ConfigurationNotFound(_) => StatusCode::NOT_FOUND,
            WarrenError::InvalidOptions(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(target: "admin", error = %self.0, "Admin request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn config_handler(State(state): State<AdminState>) -> Result<Json<Vec<AgentSummary>>, ApiError> {
    let mut agents = Vec::with_capacity(state.pool.len());
    for agent in state.pool.iter() {
        agents.push(AgentSummary {
            id: agent.id().to_string(),
            name: agent.name().to_string(),
            kind: agent.kind().to_string(),
            sources: agent.config().source_ids.iter().cloned().collect(),
            capabilities: agent.capabilities().names(),
            check_interval_ms: agent.check_interval().map(|d| d.as_millis() as u64),
            options: agent.options()?,
            activity: state.activity.summary(agent.id()),
            links: AgentLinks::for_agent(agent.id()),
        });
    }
    Ok(Json(agents))
}

async fn options_handler(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.agent(&id)?.options()?))
}

async fn schema_handler(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let schema = state.agent(&id)?.options_schema()?;
    let body = serde_json::to_vec(&schema).map_err(WarrenError::from)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/schema+json")],
        body,
    )
        .into_response())
}

async fn update_options_handler(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(options): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let agent = state.agent(&id)?;
    agent.update_options(options)?;
    info!(target: "admin", agent_id = %id, "Options replaced via admin API");
    Ok(Json(agent.options()?))
}

async fn state_handler(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent = state.agent(&id)?;
    let current = agent.state().await?;
    Ok(Json(json!({ "id": id, "state": current })))
}

async fn message_log_handler(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.agent(&id)?;
    let log = state.activity.get(&id);
    let view = MessageLogView {
        id,
        incoming: log.incoming,
        outgoing: log.outgoing,
    };
    Ok(Json(serde_json::to_value(view).map_err(WarrenError::from)?))
}
