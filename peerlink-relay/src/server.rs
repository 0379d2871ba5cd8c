//! HTTP surface of the relay: WebSocket upgrade, health check, static files.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::hub::{self, HubHandle, HubStopped};
use crate::session::{self, SessionConfig};

/// Shared state handed to every request handler.
#[derive(Debug, Clone)]
pub struct RelayState {
    /// Handle to the hub task.
    pub hub: HubHandle,
    /// Limits applied to every new session.
    pub session: Arc<SessionConfig>,
}

impl RelayState {
    /// Spawns a fresh hub and wraps it with the given session limits.
    #[must_use]
    pub fn new(session: SessionConfig) -> Self {
        Self::with_hub(hub::spawn(), session)
    }

    /// Wraps an existing hub.
    #[must_use]
    pub fn with_hub(hub: HubHandle, session: SessionConfig) -> Self {
        Self {
            hub,
            session: Arc::new(session),
        }
    }

    /// Sends a close frame to every connected session.
    ///
    /// Each session's writer sends the close frame once its queue is
    /// closed, which lets clients notice the disconnect promptly. Used on
    /// graceful shutdown and in tests.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn close_all_connections(&self) -> Result<(), HubStopped> {
        self.hub.close_all().await
    }
}

/// Body of `GET /api/health`.
#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is answering.
    pub status: &'static str,
}

/// Builds the relay router.
#[must_use]
pub fn router(state: RelayState, static_dir: &Path) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the relay server on `addr` and runs it until the task is aborted.
///
/// Binding to port `0` picks a free port; the bound address is returned.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    state: RelayState,
    static_dir: &Path,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_server_with_shutdown(addr, state, static_dir, std::future::pending()).await
}

/// Starts the relay server and stops accepting connections once `shutdown`
/// resolves.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_shutdown<F>(
    addr: &str,
    state: RelayState,
    static_dir: &Path,
    shutdown: F,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, static_dir);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "ok" })
}

/// axum handler that upgrades an HTTP request to a relay session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    let limit = state.session.max_frame_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| session::handle_socket(socket, state.hub, state.session))
}
