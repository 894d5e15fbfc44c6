//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Emit JSON lines (default) or human-readable output
    pub json: bool,
}

impl TelemetryConfig {
    /// Read overrides from `TESSERA_*` variables, defaulting the service
    /// name to `service_name`.
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: std::env::var("TESSERA_SERVICE_NAME")
                .unwrap_or_else(|_| service_name.to_string()),
            environment: std::env::var("TESSERA_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            default_filter: std::env::var("TESSERA_LOG_FILTER").unwrap_or_else(|_| {
                "tessera_api=debug,tessera_storage=info,tessera_events=info,tower_http=debug,info"
                    .to_string()
            }),
            json: std::env::var("TESSERA_LOG_JSON")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(true),
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        "Telemetry initialized"
    );
    Ok(())
}
