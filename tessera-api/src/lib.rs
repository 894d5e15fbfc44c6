//! TESSERA API - Cache management HTTP surface and service wiring
//!
//! Serves the admin cache endpoints of a storage node (`/cache/*`), health
//! probes and Prometheus metrics, and hosts the background jobs shared by the
//! `tessera-node` and `tessera-sync` binaries.

pub mod auth;
pub mod config;
pub mod error;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod telemetry;

// Re-export commonly used types
pub use auth::{
    authenticate, generate_jwt_token, require_role, validate_jwt_token, AuthConfig, AuthContext,
    Claims, JwtClock, JwtSecret,
};
pub use config::{ApiConfig, SyncConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{consistency_sweep_task, metrics_mirror_task, CounterSource, SweepConfig};
pub use middleware::{auth_middleware, AuthExtractor, AuthMiddlewareState};
pub use routes::health::{DownstreamProbe, ReadinessProbe};
pub use routes::{create_api_router, create_ops_router};
