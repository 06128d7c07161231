use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use agentmesh_core::config::RouterConfig;

use crate::routes;
use crate::service::RouterService;
use crate::state::AppState;

/// WebSocket + HTTP router server built on axum.
pub struct RouterServer {
    config: RouterConfig,
    service: Arc<RouterService>,
}

impl RouterServer {
    pub fn new(config: RouterConfig, service: Arc<RouterService>) -> Self {
        Self { config, service }
    }

    pub fn service(&self) -> &Arc<RouterService> {
        &self.service
    }

    fn app(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        });

        Router::new()
            // Agent channel
            .route("/agents/ws", get(routes::agent_ws))
            // REST API
            .route("/agents", get(routes::list_agents))
            .route("/workflows", post(routes::submit_workflow))
            .route("/api/health", get(routes::health))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind `config.bind` and serve until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(bind = %listener.local_addr()?, "Router listening");

        // Agent sockets are upgraded connections; close them so shutdown can finish
        let service = self.service.clone();
        axum::serve(listener, self.app())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                service.shutdown().await;
            })
            .await?;

        info!("Router shut down");
        Ok(())
    }
}
