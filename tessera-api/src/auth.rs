//! Authentication Module
//!
//! Bearer JWT authentication for the cache management surface. Tokens are
//! HS256-signed; the caller's roles come from the `roles` claim and cache
//! management requires the configured admin role.

use crate::error::{ApiError, ApiResult};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{ConfigError, TesseraError};

const INSECURE_DEFAULT_SECRET: &str = "INSECURE_DEFAULT_SECRET_CHANGE_IN_PRODUCTION";

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Clock used for JWT time validation.
///
/// Token times are checked here rather than inside `jsonwebtoken` so tests can
/// pin the clock and a pre-epoch system clock is reported instead of panicking.
pub trait JwtClock: Send + Sync {
    /// Current time as Unix epoch seconds. Negative for pre-1970 clocks.
    fn now_epoch_secs(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl JwtClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl JwtClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}

/// Test clock helpers for common scenarios.
pub mod test_clocks {
    use super::FixedClock;

    /// 2024-01-01 00:00:00 UTC
    pub fn valid() -> FixedClock {
        FixedClock(1704067200)
    }

    /// 2030-01-01 00:00:00 UTC
    pub fn future() -> FixedClock {
        FixedClock(1893456000)
    }
}

// ============================================================================
// JWT SECRET
// ============================================================================

/// JWT signing secret. Never printed.
#[derive(Clone)]
pub struct JwtSecret(SecretString);

impl JwtSecret {
    /// # Errors
    /// Returns error if the secret is empty.
    pub fn new(secret: String) -> Result<Self, TesseraError> {
        if secret.is_empty() {
            return Err(TesseraError::Config(ConfigError::MissingRequired {
                field: "jwt_secret".to_string(),
            }));
        }
        Ok(Self(SecretString::new(secret.into())))
    }

    /// Expose the secret value for signing and verification only.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub fn is_insecure_default(&self) -> bool {
        self.0.expose_secret() == INSECURE_DEFAULT_SECRET
    }
}

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtSecret([REDACTED, {} chars])", self.len())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// JWT secret key for signing and verification
    pub jwt_secret: JwtSecret,

    /// JWT algorithm (default: HS256)
    pub jwt_algorithm: Algorithm,

    /// Lifetime of generated tokens in seconds (default: 1 hour)
    pub jwt_expiration_secs: i64,

    /// Clock skew tolerance in seconds (default: 60)
    pub jwt_clock_skew_secs: i64,

    /// Role required by the cache management endpoints (default: "admin")
    pub admin_role: String,

    /// Clock for JWT time validation
    pub clock: Arc<dyn JwtClock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret)
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("jwt_expiration_secs", &self.jwt_expiration_secs)
            .field("jwt_clock_skew_secs", &self.jwt_clock_skew_secs)
            .field("admin_role", &self.admin_role)
            .field("clock", &"<JwtClock>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        let secret_str = std::env::var("TESSERA_JWT_SECRET")
            .unwrap_or_else(|_| INSECURE_DEFAULT_SECRET.to_string());

        Self {
            jwt_secret: build_jwt_secret(secret_str),
            jwt_algorithm: Algorithm::HS256,
            jwt_expiration_secs: 3600,
            jwt_clock_skew_secs: 60,
            admin_role: "admin".to_string(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl AuthConfig {
    /// Create authentication configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `TESSERA_JWT_SECRET`: JWT signing secret
    /// - `TESSERA_JWT_EXPIRATION_SECS`: token lifetime (default: 3600)
    /// - `TESSERA_JWT_CLOCK_SKEW_SECS`: clock skew tolerance (default: 60)
    /// - `TESSERA_ADMIN_ROLE`: role required for cache management (default: admin)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            jwt_expiration_secs: std::env::var("TESSERA_JWT_EXPIRATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.jwt_expiration_secs),
            jwt_clock_skew_secs: std::env::var("TESSERA_JWT_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.jwt_clock_skew_secs),
            admin_role: std::env::var("TESSERA_ADMIN_ROLE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.admin_role.clone()),
            ..defaults
        }
    }

    /// Config with an explicit secret and clock, for tests and embedders.
    pub fn with_secret(secret: &str, clock: Arc<dyn JwtClock>) -> ApiResult<Self> {
        let jwt_secret = JwtSecret::new(secret.to_string())
            .map_err(|_| ApiError::invalid_input("JWT secret must not be empty"))?;
        Ok(Self {
            jwt_secret,
            clock,
            ..Self::default()
        })
    }

    /// Refuse insecure secrets when `TESSERA_ENVIRONMENT` is production.
    ///
    /// Outside production the problems are logged and startup continues.
    pub fn validate_for_production(&self) -> ApiResult<()> {
        let environment = std::env::var("TESSERA_ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase();
        let is_production = environment == "production" || environment == "prod";

        if self.jwt_secret.is_insecure_default() {
            if is_production {
                return Err(ApiError::invalid_input(format!(
                    "Cannot start in production with the default JWT secret. \
                     Set TESSERA_JWT_SECRET. TESSERA_ENVIRONMENT={}",
                    environment
                )));
            }
            tracing::warn!(
                "Using the insecure default JWT secret. Set TESSERA_JWT_SECRET before deploying."
            );
        }

        if self.jwt_secret.len() < 32 {
            if is_production {
                return Err(ApiError::invalid_input(format!(
                    "JWT secret is too short for production use ({} chars). \
                     It must be at least 32 characters long.",
                    self.jwt_secret.len()
                )));
            } else if !self.jwt_secret.is_insecure_default() {
                tracing::warn!(
                    ctx_secret_len = self.jwt_secret.len(),
                    "JWT secret is shorter than 32 characters"
                );
            }
        }

        Ok(())
    }
}

fn build_jwt_secret(secret_str: String) -> JwtSecret {
    let normalized = if secret_str.trim().is_empty() {
        INSECURE_DEFAULT_SECRET.to_string()
    } else {
        secret_str
    };
    match JwtSecret::new(normalized) {
        Ok(secret) => secret,
        Err(_) => JwtSecret(SecretString::new(INSECURE_DEFAULT_SECRET.to_string().into())),
    }
}

// ============================================================================
// JWT CLAIMS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn new(user_id: String, expiration_secs: i64, clock: &dyn JwtClock) -> Self {
        let now = clock.now_epoch_secs();
        Self {
            sub: user_id,
            iat: now,
            exp: now + expiration_secs,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn is_expired(&self, clock: &dyn JwtClock) -> bool {
        self.exp < clock.now_epoch_secs()
    }
}

// ============================================================================
// AUTHENTICATION CONTEXT
// ============================================================================

/// Authenticated caller, inserted into request extensions by the auth
/// middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn new(user_id: String, roles: Vec<String>) -> Self {
        Self { user_id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

// ============================================================================
// AUTHENTICATION FUNCTIONS
// ============================================================================

fn validate_claim_times(now: i64, exp: i64, leeway_secs: i64) -> ApiResult<()> {
    if exp < now - leeway_secs {
        return Err(ApiError::token_expired());
    }
    Ok(())
}

/// Verify a token's signature and expiry and return its claims.
///
/// Signature checking is done by `jsonwebtoken`; expiry is checked against
/// `config.clock` with `jwt_clock_skew_secs` of leeway.
pub fn validate_jwt_token(config: &AuthConfig, token: &str) -> ApiResult<Claims> {
    let decoding_key = DecodingKey::from_secret(config.jwt_secret.expose().as_bytes());

    let mut validation = Validation::new(config.jwt_algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims = std::collections::HashSet::from(["exp".to_string()]);

    let token_data =
        decode::<Claims>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidToken => {
                ApiError::invalid_token("Token is invalid")
            }
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                ApiError::invalid_token("Token signature is invalid")
            }
            _ => ApiError::invalid_token(format!("Token validation failed: {}", e)),
        })?;

    let claims = token_data.claims;
    let now = config.clock.now_epoch_secs();

    if now < 0 {
        tracing::error!(
            timestamp = now,
            "System clock returned pre-epoch time - server time is broken"
        );
        return Err(ApiError::internal_error(
            "Server time configuration error - please contact support",
        ));
    }

    validate_claim_times(now, claims.exp, config.jwt_clock_skew_secs)?;
    Ok(claims)
}

/// Sign a token for `user_id` carrying `roles`.
pub fn generate_jwt_token(
    config: &AuthConfig,
    user_id: String,
    roles: Vec<String>,
) -> ApiResult<String> {
    let claims = Claims::new(user_id, config.jwt_expiration_secs, &*config.clock).with_roles(roles);
    let encoding_key = EncodingKey::from_secret(config.jwt_secret.expose().as_bytes());
    let header = Header::new(config.jwt_algorithm);

    encode(&header, &claims, &encoding_key)
        .map_err(|e| ApiError::internal_error(format!("Failed to generate token: {}", e)))
}

/// Authenticate from the raw `Authorization` header value.
pub fn authenticate(config: &AuthConfig, auth_header: Option<&str>) -> ApiResult<AuthContext> {
    let Some(auth_value) = auth_header else {
        return Err(ApiError::unauthorized(
            "Authentication required: provide an Authorization header",
        ));
    };
    let Some(token) = auth_value.strip_prefix("Bearer ") else {
        return Err(ApiError::invalid_token(
            "Authorization header must use Bearer scheme",
        ));
    };
    let claims = validate_jwt_token(config, token.trim())?;
    Ok(AuthContext::new(claims.sub, claims.roles))
}

/// Require `role` on an authenticated caller.
pub fn require_role(auth: &AuthContext, role: &str) -> ApiResult<()> {
    if auth.has_role(role) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("Role '{}' required", role))
            .with_details(serde_json::json!({ "required_role": role })))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let previous = std::env::var(key).ok();
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.previous.as_deref() {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    fn test_config() -> AuthConfig {
        AuthConfig::with_secret("test_secret", Arc::new(test_clocks::valid()))
            .expect("Test secret should be valid")
    }

    #[test]
    fn test_jwt_generation_and_validation() -> ApiResult<()> {
        let config = test_config();
        let roles = vec!["admin".to_string()];

        let token = generate_jwt_token(&config, "ops".to_string(), roles.clone())?;
        let claims = validate_jwt_token(&config, &token)?;

        assert_eq!(claims.sub, "ops");
        assert_eq!(claims.roles, roles);
        assert!(!claims.is_expired(&test_clocks::valid()));
        Ok(())
    }

    #[test]
    fn test_expired_token() -> ApiResult<()> {
        let mut config = test_config();
        let token = generate_jwt_token(&config, "ops".to_string(), vec![])?;
        config.clock = Arc::new(test_clocks::future());

        let err = validate_jwt_token(&config, &token).expect_err("token should be expired");
        assert_eq!(err.code, ErrorCode::TokenExpired);
        Ok(())
    }

    #[test]
    fn test_wrong_secret_rejected() -> ApiResult<()> {
        let token = generate_jwt_token(&test_config(), "ops".to_string(), vec![])?;
        let other = AuthConfig::with_secret("another_secret", Arc::new(test_clocks::valid()))?;

        let err = validate_jwt_token(&other, &token).expect_err("signature mismatch");
        assert_eq!(err.code, ErrorCode::InvalidToken);
        Ok(())
    }

    #[test]
    fn test_authenticate_header_forms() -> ApiResult<()> {
        let config = test_config();
        let token = generate_jwt_token(&config, "ops".to_string(), vec!["admin".to_string()])?;

        let auth = authenticate(&config, Some(&format!("Bearer {}", token)))?;
        assert_eq!(auth.user_id, "ops");
        assert!(auth.has_role("admin"));

        let err = authenticate(&config, None).expect_err("missing header");
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let err = authenticate(&config, Some(&format!("Basic {}", token))).expect_err("scheme");
        assert_eq!(err.code, ErrorCode::InvalidToken);
        Ok(())
    }

    #[test]
    fn test_require_role() {
        let admin = AuthContext::new("ops".to_string(), vec!["admin".to_string()]);
        let viewer = AuthContext::new("dev".to_string(), vec!["viewer".to_string()]);

        assert!(require_role(&admin, "admin").is_ok());
        let err = require_role(&viewer, "admin").expect_err("viewer is not admin");
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[test]
    fn test_clock_skew_tolerance() -> ApiResult<()> {
        let mut config = test_config();
        config.jwt_expiration_secs = 100;
        let token = generate_jwt_token(&config, "ops".to_string(), vec![])?;

        config.clock = Arc::new(FixedClock(test_clocks::valid().0 + 130));
        assert!(validate_jwt_token(&config, &token).is_ok());

        config.clock = Arc::new(FixedClock(test_clocks::valid().0 + 200));
        let err = validate_jwt_token(&config, &token).expect_err("beyond leeway");
        assert_eq!(err.code, ErrorCode::TokenExpired);
        Ok(())
    }

    #[test]
    fn test_pre_epoch_clock_fails_loud() -> ApiResult<()> {
        let mut config = test_config();
        let token = generate_jwt_token(&config, "ops".to_string(), vec![])?;
        config.clock = Arc::new(FixedClock(-1000));

        let err = validate_jwt_token(&config, &token).expect_err("broken clock");
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(err.message.contains("time configuration error"));
        Ok(())
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = JwtSecret::new("hunter2-hunter2".to_string()).expect("valid secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("15 chars"));
        assert!(JwtSecret::new(String::new()).is_err());
    }

    #[test]
    fn test_production_validation_rejects_insecure_default() {
        let _env_lock = ENV_MUTEX.lock().expect("env mutex should not be poisoned");
        let _env_guard = EnvVarGuard::set("TESSERA_ENVIRONMENT", Some("production"));
        let _secret_guard = EnvVarGuard::set("TESSERA_JWT_SECRET", None);

        assert!(AuthConfig::default().validate_for_production().is_err());
    }

    #[test]
    fn test_production_validation_allows_secure_secret() {
        let _env_lock = ENV_MUTEX.lock().expect("env mutex should not be poisoned");
        let _env_guard = EnvVarGuard::set("TESSERA_ENVIRONMENT", Some("production"));
        let config = AuthConfig::with_secret(
            "this-is-a-very-secure-secret-that-is-at-least-32-characters-long",
            Arc::new(SystemClock),
        )
        .expect("test secret should be valid");

        assert!(config.validate_for_production().is_ok());
    }

    #[test]
    fn test_production_validation_allows_development() {
        let _env_lock = ENV_MUTEX.lock().expect("env mutex should not be poisoned");
        let _env_guard = EnvVarGuard::set("TESSERA_ENVIRONMENT", None);

        assert!(AuthConfig::default().validate_for_production().is_ok());
    }

    #[test]
    fn test_admin_role_from_env() {
        let _env_lock = ENV_MUTEX.lock().expect("env mutex should not be poisoned");
        let _role_guard = EnvVarGuard::set("TESSERA_ADMIN_ROLE", Some("cache-admin"));

        assert_eq!(AuthConfig::from_env().admin_role, "cache-admin");
    }
}
