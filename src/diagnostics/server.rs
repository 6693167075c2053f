use crate::{
    config::DiagnosticsConfig,
    error::{Result, SyncError},
    feed::GlobalIncidentFeed,
    session::StreamSession,
    transport::TransportChannel,
};
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::handlers::{
    global_incidents_handler, health_handler, incidents_handler, session_handler,
    transport_handler,
};

/// Shared state for the diagnostics routes
#[derive(Clone)]
pub struct DiagnosticsState {
    pub(crate) session: Arc<StreamSession>,
    pub(crate) transport: Arc<TransportChannel>,
    pub(crate) feed: Option<Arc<GlobalIncidentFeed>>,
}

/// HTTP server exposing session and transport state as JSON
pub struct DiagnosticsServer {
    pub(crate) config: DiagnosticsConfig,
    pub(crate) state: DiagnosticsState,
}

impl DiagnosticsServer {
    pub fn new(
        config: DiagnosticsConfig,
        session: Arc<StreamSession>,
        transport: Arc<TransportChannel>,
    ) -> Self {
        Self {
            config,
            state: DiagnosticsState {
                session,
                transport,
                feed: None,
            },
        }
    }

    /// Also serve the channel-wide incident feed
    pub fn with_global_feed(mut self, feed: Arc<GlobalIncidentFeed>) -> Self {
        self.state.feed = Some(feed);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.ip, self.config.port)
    }

    pub(crate) fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/session", get(session_handler))
            .route("/transport", get(transport_handler))
            .route("/incidents", get(incidents_handler))
            .route("/incidents/global", get(global_incidents_handler))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.address();
        info!("Starting diagnostics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            SyncError::component("diagnostics", format!("Failed to bind {}: {}", addr, e))
        })?;

        info!("Diagnostics server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| SyncError::component("diagnostics", format!("Server error: {}", e)))?;

        info!("Diagnostics server stopped");
        Ok(())
    }
}

/// Builder for [`DiagnosticsServer`]
pub struct DiagnosticsServerBuilder {
    config: Option<DiagnosticsConfig>,
    session: Option<Arc<StreamSession>>,
    transport: Option<Arc<TransportChannel>>,
    feed: Option<Arc<GlobalIncidentFeed>>,
}

impl DiagnosticsServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            session: None,
            transport: None,
            feed: None,
        }
    }

    pub fn config(mut self, config: DiagnosticsConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn session(mut self, session: Arc<StreamSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn transport(mut self, transport: Arc<TransportChannel>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn global_feed(mut self, feed: Arc<GlobalIncidentFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn build(self) -> Result<DiagnosticsServer> {
        let config = self.config.ok_or_else(|| {
            SyncError::component("diagnostics", "Diagnostics configuration is required")
        })?;

        let session = self
            .session
            .ok_or_else(|| SyncError::component("diagnostics", "Stream session is required"))?;

        let transport = self.transport.ok_or_else(|| {
            SyncError::component("diagnostics", "Transport channel is required")
        })?;

        let server = DiagnosticsServer::new(config, session, transport);
        Ok(match self.feed {
            Some(feed) => server.with_global_feed(feed),
            None => server,
        })
    }
}

impl Default for DiagnosticsServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
