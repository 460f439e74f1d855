//! Realtime WebSocket gateway.

pub mod dispatch;
pub mod protocol;
pub mod session;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;

use crate::{
    auth::{auth_middleware, CallerIdentity},
    config::{AuthConfig, GatewayConfig},
};

pub use dispatch::{ActiveCompany, Dispatcher, SessionContext};
pub use session::SessionState;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: GatewayConfig,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("could not bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Server(String),
}

pub fn router(state: Arc<AppState>, auth: Arc<AuthConfig>) -> Router {
    let ws = Router::new()
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn(auth_middleware))
        .layer(Extension(auth));

    Router::new()
        .merge(ws)
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<CallerIdentity>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.gateway.max_message_bytes)
        .on_upgrade(move |socket| session::run(socket, identity, state))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

/// Binds `addr`, retrying with a doubling delay while the port is busy.
pub async fn bind_with_backoff(
    addr: SocketAddr,
    attempts: u32,
    initial_delay: Duration,
) -> Result<std::net::TcpListener, ServeError> {
    let attempts = attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true).map_err(|source| ServeError::Bind {
                    addr,
                    attempts: attempt,
                    source,
                })?;
                tracing::info!(%addr, attempt, "Listener bound");
                return Ok(listener);
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(%addr, attempt, error = %e, retry_in_ms = delay.as_millis() as u64, "Bind failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(source) => {
                return Err(ServeError::Bind {
                    addr,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}

pub async fn serve<F>(listener: std::net::TcpListener, app: Router, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::Server::from_tcp(listener)
        .map_err(|e| ServeError::Server(e.to_string()))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServeError::Server(e.to_string()))
}
