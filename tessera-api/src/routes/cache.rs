//! Cache Management Routes
//!
//! Admin-only operations on the node's query cache. Rebuild and cleanup
//! endpoints always answer with their report; failures inside a run are
//! listed in the report's `errors`.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tessera_core::{CleanupReport, ConsistencyReport, RebuildReport};
use tessera_storage::{LockStatus, Node};

use crate::error::{ApiError, ApiResult};
use crate::middleware::AuthExtractor;
use crate::telemetry::metrics::with_metrics;

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Clone)]
pub struct CacheState {
    pub node: Arc<Node>,
}

impl CacheState {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

/// Run `op` on its own task so a client disconnect does not cancel a
/// rebuild half way through.
async fn detached<T, F, Fut>(state: &CacheState, op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<Node>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    tokio::spawn(op(state.node.clone())).await.map_err(|e| {
        tracing::error!(error = %e, "Cache maintenance task failed");
        ApiError::internal_error("Cache maintenance task failed")
    })
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /cache/consistency - Compare the attribute store with the cache
pub async fn consistency(
    State(state): State<Arc<CacheState>>,
    AuthExtractor(auth): AuthExtractor,
) -> ApiResult<Json<ConsistencyReport>> {
    let report = detached(&state, |node| async move { node.auditor().check().await })
        .await??;
    with_metrics(|m| m.record_consistency(&report));

    tracing::info!(
        ctx_user_id = %auth.user_id,
        ctx_is_consistent = report.is_consistent,
        ctx_orphan_cache = report.orphan_cache_count,
        ctx_orphan_attr = report.orphan_attr_count,
        "Consistency check requested"
    );
    Ok(Json(report))
}

/// POST /cache/rebuild - Full rebuild
pub async fn rebuild_full(
    State(state): State<Arc<CacheState>>,
    AuthExtractor(auth): AuthExtractor,
) -> ApiResult<Json<RebuildReport>> {
    tracing::info!(ctx_user_id = %auth.user_id, "Full cache rebuild requested");
    let report = detached(&state, |node| async move { node.rebuild().full().await }).await?;
    with_metrics(|m| m.record_rebuild(&report));
    Ok(Json(report))
}

/// POST /cache/rebuild/incremental - Add missing rows only
pub async fn rebuild_incremental(
    State(state): State<Arc<CacheState>>,
    AuthExtractor(auth): AuthExtractor,
) -> ApiResult<Json<RebuildReport>> {
    tracing::info!(ctx_user_id = %auth.user_id, "Incremental cache rebuild requested");
    let report =
        detached(&state, |node| async move { node.rebuild().incremental().await }).await?;
    with_metrics(|m| m.record_rebuild(&report));
    Ok(Json(report))
}

/// POST /cache/cleanup-expired - Remove expired and orphaned rows
pub async fn cleanup_expired(
    State(state): State<Arc<CacheState>>,
    AuthExtractor(auth): AuthExtractor,
) -> ApiResult<Json<CleanupReport>> {
    let report =
        detached(&state, |node| async move { node.rebuild().cleanup_expired().await }).await?;
    tracing::info!(
        ctx_user_id = %auth.user_id,
        ctx_removed = report.removed,
        "Cache cleanup requested"
    );
    Ok(Json(report))
}

/// GET /cache/lock - Current rebuild lock holder and queue depth
pub async fn lock_status(State(state): State<Arc<CacheState>>) -> Json<LockStatus> {
    Json(state.node.lock_status())
}

// ============================================================================
// ROUTER
// ============================================================================

/// Cache routes. The caller layers authentication on top.
pub fn create_router(node: Arc<Node>) -> Router {
    let state = Arc::new(CacheState::new(node));

    Router::new()
        .route("/consistency", get(consistency))
        .route("/rebuild", post(rebuild_full))
        .route("/rebuild/incremental", post(rebuild_incremental))
        .route("/cleanup-expired", post(cleanup_expired))
        .route("/lock", get(lock_status))
        .with_state(state)
}
