//! HTTP monitoring API.
//!
//! A small read-mostly REST surface over the running pool: pool totals,
//! the connected sessions, and coinbase tag invalidation. Built on Axum.
//!
//! The API binds to localhost by default and has no authentication.

mod v0;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::events::EventEmitter;
use crate::job::JobManager;
use crate::session::SessionRegistry;
use crate::tags::TagCache;
use crate::tracing::prelude::*;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub instance: Arc<str>,
    pub started: Instant,
    pub registry: Arc<SessionRegistry>,
    pub jobs: Arc<JobManager>,
    pub tags: Arc<TagCache>,
    pub events: EventEmitter,
}

/// Bind `addr` and serve the API until `shutdown` fires.
pub async fn serve(addr: &str, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API address {}", addr))?;
    serve_listener(listener, state, shutdown).await
}

/// Serve the API on an already-bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<()> {
    let actual_addr = listener.local_addr()?;
    info!(url = %format!("http://{}", actual_addr), "API server listening.");

    if !actual_addr.ip().is_loopback() {
        warn!(
            "API server is bound to a non-localhost address ({}). \
             This exposes the API to the network without authentication.",
            actual_addr.ip()
        );
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;
    Ok(())
}

/// Build the application router with all API routes.
pub(crate) fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v0", v0::routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
