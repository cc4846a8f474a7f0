//! HTTP access layer: login, listing and download of stored objects

pub mod auth;
pub mod files;
pub mod pages;

use crate::storage::ObjectStore;
use anyhow::{Context, Result};
use auth::{Credentials, SessionStore};
use axum::{
    extract::State,
    middleware,
    response::{IntoResponse, Redirect},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<Credentials>,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>, credentials: Credentials, session_ttl: Duration) -> Self {
        Self {
            store,
            sessions: Arc::new(SessionStore::new(session_ttl)),
            credentials: Arc::new(credentials),
        }
    }
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/files", get(files::list_files))
        .route("/download", get(files::download))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    Router::new()
        .route("/", get(|| async { Redirect::to("/login") }))
        .route("/login", get(auth::login_page).post(auth::login))
        .route("/logout", get(auth::logout))
        .route("/health", get(health_check))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "filedrop",
        "active_logins": state.sessions.len(),
    }))
}

/// Serve the gateway on `listener` until `shutdown` is cancelled.
///
/// Requests already in flight are allowed to finish.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state);
    let addr = listener
        .local_addr()
        .context("Failed to read HTTP listener address")?;

    info!(address = %addr, "Starting HTTP gateway");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    info!("HTTP gateway stopped");
    Ok(())
}
