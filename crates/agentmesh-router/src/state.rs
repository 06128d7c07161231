use std::sync::Arc;

use agentmesh_core::config::RouterConfig;

use crate::service::RouterService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: RouterConfig,
    pub service: Arc<RouterService>,
}
