// Admin module - read-mostly HTTP view over the agent pool
//
// Exposes configuration, options (with JSON schema), live state and the
// activity log of every agent. Option updates are the only write.

mod api;

pub use api::{router, AdminState, AgentLinks, AgentSummary};

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::AdminConfig;
use crate::runtime::Runtime;

/// Admin HTTP server
pub struct AdminServer {
    config: AdminConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(config: AdminConfig, state: AdminState) -> Self {
        Self { config, state }
    }

    pub fn for_runtime(config: AdminConfig, runtime: &Runtime) -> Self {
        Self::new(
            config,
            AdminState {
                pool: Arc::clone(runtime.pool()),
                activity: Arc::clone(runtime.activity()),
            },
        )
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Binds and serves until the task is dropped or the listener fails.
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.addr();
        info!(target: "admin", addr = %addr, "Starting admin server");

        let app = router(self.state).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(
            target: "admin",
            url = %format!("http://{}", addr),
            "Admin server ready"
        );

        axum::serve(listener, app).await?;
        Ok(())
    }
}
