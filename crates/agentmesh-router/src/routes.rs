use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use agentmesh_core::types::Plan;
use agentmesh_engine::ExecutionResult;

use crate::connection;
use crate::state::AppState;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.service.discover(None).await.len();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "router_id": state.service.router_id(),
        "agents": agents,
    }))
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    pub agent_id: Option<String>,
}

// GET /agents/ws?agent_id=... (WebSocket upgrade)
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConnectQuery>,
) -> Response {
    let Some(agent_id) = q.agent_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "agent_id query parameter is required").into_response();
    };
    info!(agent_id = %agent_id, "Agent WebSocket connection");
    let service = state.service.clone();
    let buffer = state.config.outbound_buffer;
    ws.on_upgrade(move |socket| connection::handle_socket(socket, agent_id, service, buffer))
}

#[derive(Deserialize)]
pub struct DiscoveryQuery {
    pub capability: Option<String>,
}

// GET /agents?capability=...
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DiscoveryQuery>,
) -> Json<serde_json::Value> {
    let agents = state.service.discover(q.capability.as_deref()).await;
    Json(serde_json::json!({ "agents": agents }))
}

// POST /workflows
pub async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    Json(plan): Json<Plan>,
) -> Json<ExecutionResult> {
    info!(plan_id = %plan.plan_id, steps = plan.steps.len(), "Workflow submitted");
    Json(state.service.execute_plan(plan).await)
}
