/// API request handlers

use super::responses::*;
use anonroute_core::{BroadcastNotifier, CurrentRelay, Session};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub events: BroadcastNotifier,
}

/// Handler for GET /api/routes
pub async fn get_routes(State(state): State<AppState>) -> Result<Json<RoutesResponse>, AppError> {
    debug!("API: GET /api/routes");

    let routes: Vec<RouteInfo> = state
        .session
        .routes()
        .await
        .into_iter()
        .map(RouteInfo::from)
        .collect();
    let total = routes.len();

    Ok(Json(RoutesResponse { routes, total }))
}

/// Handler for GET /api/rules
pub async fn get_rules(State(state): State<AppState>) -> Result<Json<RulesResponse>, AppError> {
    debug!("API: GET /api/rules");

    let routes = state.session.route_specs().await;
    let total = routes.len();

    Ok(Json(RulesResponse { routes, total }))
}

/// Handler for GET /api/relay/current
pub async fn get_current_relay(
    State(state): State<AppState>,
) -> Result<Json<CurrentRelay>, AppError> {
    debug!("API: GET /api/relay/current");

    state
        .session
        .current_relay()
        .await
        .map(Json)
        .ok_or_else(|| AppError::unavailable("Relay data unavailable"))
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    debug!("API: GET /api/status");

    let routes = state.session.routes().await;
    let specs = state.session.route_specs().await;
    let unrouted = specs
        .iter()
        .filter(|spec| !routes.iter().any(|r| r.target == spec.target_address))
        .count();

    Ok(Json(StatusResponse {
        is_running: state.session.is_running().await,
        mapped_routes: routes.len(),
        configured_routes: specs.len(),
        unrouted,
    }))
}

/// Handler for GET /api/events
///
/// Server-sent events, one per notification, named by its channel.
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!("API: GET /api/events");

    let events = stream::unfold(state.events.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let event = Event::default()
                        .event(notification.channel())
                        .json_data(&notification);
                    return Some((event, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber fell behind, notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));

        (self.status_code, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
