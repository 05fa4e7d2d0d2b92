//! API v0 endpoints.
//!
//! Version 0 signals an unstable API -- breaking changes are expected
//! until the pool reaches 1.0.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use super::ApiState;
use crate::api_client::types::{JobState, PoolState, SessionInfo, TagInvalidation};
use crate::tracing::prelude::*;

/// Build the v0 API routes.
pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/pool", get(get_pool))
        .route("/sessions", get(get_sessions))
        .route("/tags/:identity/invalidate", post(invalidate_tag))
}

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}

/// Pool totals and the current job.
async fn get_pool(State(state): State<ApiState>) -> Json<PoolState> {
    let totals = state.registry.totals();
    let job = state.jobs.current_job().map(|job| JobState {
        generation: job.generation,
        height: job.height,
        prev_hash: job.prev_blockhash.to_string(),
        tx_count: job.transactions.len(),
        fee_total: job.fee_total,
        coinbase_value: job.coinbase_value,
    });
    Json(PoolState {
        instance: state.instance.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        sessions: state.registry.len(),
        sessions_total: totals.sessions,
        shares_accepted: totals.accepted,
        shares_rejected: totals.rejected,
        blocks_found: totals.blocks,
        events_dropped: state.events.dropped(),
        tag_cache_entries: state.tags.len(),
        job,
    })
}

async fn get_sessions(State(state): State<ApiState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.sessions())
}

/// Forget a cached coinbase tag so the next authorize fetches it again.
///
/// # Example
/// ```bash
/// curl -X POST http://localhost:7785/api/v0/tags/$ADDRESS/invalidate
/// ```
async fn invalidate_tag(
    State(state): State<ApiState>,
    Path(identity): Path<String>,
) -> Json<TagInvalidation> {
    let invalidated = state.tags.invalidate(&identity);
    debug!(identity = %identity, invalidated, "Tag invalidation requested");
    Json(TagInvalidation {
        identity,
        invalidated,
    })
}
