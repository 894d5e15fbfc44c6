//! Axum Middleware for Authentication and Authorization
//!
//! - Authenticates requests with a bearer JWT
//! - Optionally requires a role (the cache management routes require the
//!   configured admin role)
//! - Injects [`AuthContext`] into request extensions
//! - Returns 401 for unauthenticated requests and 403 for a missing role

use crate::auth::{authenticate, require_role, AuthConfig, AuthContext};
use crate::error::ApiError;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

// ============================================================================
// MIDDLEWARE STATE
// ============================================================================

#[derive(Debug, Clone)]
pub struct AuthMiddlewareState {
    pub auth_config: Arc<AuthConfig>,

    /// Role every request must carry, if any.
    pub required_role: Option<String>,
}

impl AuthMiddlewareState {
    /// Authentication only.
    pub fn new(auth_config: AuthConfig) -> Self {
        Self {
            auth_config: Arc::new(auth_config),
            required_role: None,
        }
    }

    /// Authentication plus the configured admin role.
    pub fn admin(auth_config: AuthConfig) -> Self {
        let required_role = Some(auth_config.admin_role.clone());
        Self {
            auth_config: Arc::new(auth_config),
            required_role,
        }
    }
}

// ============================================================================
// MIDDLEWARE FUNCTION
// ============================================================================

/// Authenticate the request and enforce the state's required role.
///
/// ```ignore
/// use axum::{Router, middleware};
///
/// let auth_state = AuthMiddlewareState::admin(AuthConfig::from_env());
/// let app = Router::new()
///     .route("/cache/consistency", axum::routing::get(handler))
///     .layer(middleware::from_fn_with_state(auth_state, auth_middleware));
/// ```
pub async fn auth_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthMiddlewareError> {
    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok());

    let auth_context = authenticate(&state.auth_config, auth_header).map_err(|e| {
        tracing::debug!(error = %e, "Request authentication failed");
        AuthMiddlewareError(e)
    })?;

    if let Some(role) = state.required_role.as_deref() {
        require_role(&auth_context, role).map_err(|e| {
            tracing::warn!(
                ctx_user_id = %auth_context.user_id,
                ctx_required_role = role,
                "Caller lacks required role"
            );
            AuthMiddlewareError(e)
        })?;
    }

    request.extensions_mut().insert(auth_context);
    Ok(next.run(request).await)
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Middleware rejection; renders as the wrapped [`ApiError`].
#[derive(Debug)]
pub struct AuthMiddlewareError(pub ApiError);

impl IntoResponse for AuthMiddlewareError {
    fn into_response(self) -> Response {
        self.0.into_response()
    }
}

// ============================================================================
// TYPED EXTRACTOR
// ============================================================================

/// Typed extractor for the authenticated caller.
///
/// Requires `auth_middleware` on the route; without it the extractor answers
/// 500.
#[derive(Debug, Clone)]
pub struct AuthExtractor(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthExtractor
where
    S: Send + Sync,
{
    type Rejection = AuthMiddlewareError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(AuthExtractor)
            .ok_or_else(|| {
                AuthMiddlewareError(ApiError::internal_error(
                    "AuthContext not found in request extensions. \
                     Ensure auth_middleware is applied to this route.",
                ))
            })
    }
}

impl std::ops::Deref for AuthExtractor {
    type Target = AuthContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
