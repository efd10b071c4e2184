/// API Server implementation

use super::handlers::*;
use anonroute_core::{BroadcastNotifier, Session};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// API Server exposing the proxy session's routing state
pub struct ApiServer {
    listen_addr: SocketAddr,
    session: Arc<Session>,
    events: BroadcastNotifier,
}

impl ApiServer {
    /// `events` should be the notifier the session pushes to
    pub fn new(listen_addr: SocketAddr, session: Arc<Session>, events: BroadcastNotifier) -> Self {
        Self {
            listen_addr,
            session,
            events,
        }
    }

    /// Build the router with all endpoints
    pub fn router(session: Arc<Session>, events: BroadcastNotifier) -> Router {
        let state = AppState { session, events };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/routes", get(get_routes))
            .route("/api/rules", get(get_rules))
            .route("/api/relay/current", get(get_current_relay))
            .route("/api/status", get(get_status))
            .route("/api/events", get(stream_events))
            // Allow the UI to call from another origin
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until the listener fails
    pub async fn start(self) -> Result<()> {
        let app = Self::router(self.session.clone(), self.events.clone());

        info!("API server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
