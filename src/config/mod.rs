use crate::{constants, CoreError, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[cfg(test)]
mod tests;

/// Deployment environment. Error responses include full detail only in
/// `Development`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub provider: ProviderConfig,
    pub runtime: RuntimeConfig,
    /// First-run seeding of a platform tenant and super admin; applied
    /// only when no tenant exists yet.
    pub bootstrap: Option<BootstrapConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub tenant_domain: String,
    pub admin_email: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub allowed_origins: Vec<String>,
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret mixed into generated credential material. Required; the
    /// binary exits with code 1 when it is missing or weak.
    pub token_secret: String,
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Remote model endpoint; absent means the registry runs with the
    /// safe default entry only.
    pub api_key: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub cache_sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Tenant assumed when no `X-Tenant` header arrives. Only meaningful
    /// in single-tenant deployments.
    pub default_tenant: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    ///
    /// Unknown variables are ignored for forward compatibility; missing
    /// required values fail with a configuration error the binary maps to
    /// exit code 1.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("no .env file found"),
        }
        Self::from_env()
    }

    /// Environment parsing without the `.env` side effect, for tests.
    pub fn from_env() -> Result<Self> {
        let token_secret = env::var("MERIDIAN_TOKEN_SECRET").map_err(|_| {
            CoreError::Configuration(
                "MERIDIAN_TOKEN_SECRET environment variable is required".to_string(),
            )
        })?;
        if token_secret.trim().len() < 32 {
            return Err(CoreError::Configuration(
                "MERIDIAN_TOKEN_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let environment = match env::var("MERIDIAN_ENV").as_deref() {
            Ok("development") | Err(_) => Environment::Development,
            Ok("production") => Environment::Production,
            Ok(other) => {
                return Err(CoreError::Configuration(format!(
                    "MERIDIAN_ENV must be `development` or `production`, got `{other}`"
                )));
            }
        };

        let provider_api_key = match env::var("MERIDIAN_PROVIDER_API_KEY") {
            Ok(key) if key.trim().is_empty() => {
                return Err(CoreError::Configuration(
                    "MERIDIAN_PROVIDER_API_KEY cannot be blank when set".to_string(),
                ));
            }
            Ok(key) => Some(key),
            Err(_) => None,
        };

        let allowed_origins = env::var("MERIDIAN_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let bootstrap = match (
            env::var("MERIDIAN_BOOTSTRAP_TENANT_DOMAIN").ok(),
            env::var("MERIDIAN_BOOTSTRAP_ADMIN_EMAIL").ok(),
            env::var("MERIDIAN_BOOTSTRAP_ADMIN_PASSWORD").ok(),
        ) {
            (Some(tenant_domain), Some(admin_email), Some(admin_password)) => {
                Some(BootstrapConfig {
                    tenant_domain,
                    admin_email,
                    admin_password,
                })
            }
            (None, None, None) => None,
            _ => {
                return Err(CoreError::Configuration(
                    "MERIDIAN_BOOTSTRAP_* variables must be set together".to_string(),
                ));
            }
        };

        Ok(Config {
            api: ApiConfig {
                host: env::var("MERIDIAN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("MERIDIAN_PORT", 4000),
                environment,
                allowed_origins,
                requests_per_minute: env_parse("MERIDIAN_REQUESTS_PER_MINUTE", 120),
            },
            auth: AuthConfig {
                token_secret,
                session_ttl_secs: env_parse(
                    "MERIDIAN_SESSION_TTL_SECS",
                    constants::DEFAULT_SESSION_TTL_SECS,
                ),
            },
            provider: ProviderConfig {
                api_key: provider_api_key,
                base_url: env::var("MERIDIAN_PROVIDER_BASE_URL")
                    .unwrap_or_else(|_| "https://api.modelgrid.example".to_string()),
                request_timeout_secs: env_parse("MERIDIAN_PROVIDER_TIMEOUT_SECS", 30),
            },
            runtime: RuntimeConfig {
                cache_sweep_interval_secs: env_parse(
                    "MERIDIAN_CACHE_SWEEP_SECS",
                    constants::CACHE_SWEEP_INTERVAL_SECS,
                ),
                cleanup_interval_secs: env_parse(
                    "MERIDIAN_CLEANUP_SECS",
                    constants::CLEANUP_INTERVAL_SECS,
                ),
                default_tenant: env::var("MERIDIAN_DEFAULT_TENANT").ok(),
            },
            bootstrap,
        })
    }
}
