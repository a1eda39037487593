//! REST API server: binds the `RestRouter` to a socket with graceful
//! shutdown, following the same `tokio::sync::broadcast` shutdown idiom used
//! by every other background worker in this agent.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use super::rest::RestRouter;
use crate::agent::Agent;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub rest_addr: SocketAddr,
}

pub struct ApiServer {
    config: ApiServerConfig,
    agent: Arc<Agent>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, agent: Arc<Agent>) -> Self {
        Self { config, agent }
    }

    pub async fn run(&self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let router = RestRouter::new(self.agent.clone());
        let app = router.build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind REST server: {e}")))?;

        info!(addr = %self.config.rest_addr, "REST API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {e}")))?;

        Ok(())
    }
}
