//! HTTP Routes
//!
//! - `/cache/*`: admin cache management (bearer JWT with the admin role)
//! - `/health/*`: Kubernetes-style probes, no authentication
//! - `/metrics`: Prometheus scrape endpoint, no authentication

pub mod cache;
pub mod health;

use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use tessera_storage::Node;
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::middleware::{auth_middleware, AuthMiddlewareState};
use crate::telemetry::{metrics_handler, observability_middleware};

use self::health::ReadinessProbe;

/// Router served by a storage node.
///
/// `/health/ready` checks the node plus any `extra_probes`.
pub fn create_api_router(
    node: Arc<Node>,
    extra_probes: Vec<Arc<dyn ReadinessProbe>>,
    auth_config: AuthConfig,
) -> Router {
    let auth_state = AuthMiddlewareState::admin(auth_config);

    let cache_routes = cache::create_router(node.clone())
        .layer(from_fn_with_state(auth_state, auth_middleware));

    let mut probes: Vec<Arc<dyn ReadinessProbe>> = vec![node as Arc<dyn ReadinessProbe>];
    probes.extend(extra_probes);

    observed(Router::new().nest("/cache", cache_routes).merge(ops_routes(probes)))
}

/// Health and metrics only. Served on its own by the sync worker.
pub fn create_ops_router(probes: Vec<Arc<dyn ReadinessProbe>>) -> Router {
    observed(ops_routes(probes))
}

fn ops_routes(probes: Vec<Arc<dyn ReadinessProbe>>) -> Router {
    Router::new()
        .nest("/health", health::create_router(probes))
        .route("/metrics", get(metrics_handler))
}

fn observed(router: Router) -> Router {
    router
        .layer(from_fn(observability_middleware))
        .layer(TraceLayer::new_for_http())
}
