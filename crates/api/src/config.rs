//! API server configuration

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret shared with the identity provider that issues user tokens
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    /// Interval of the in-process full subscription sync
    pub sync_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> ApiResult<Self> {
        let database_url = rise_shared::database_url()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::Config("JWT_SECRET must be set".to_string()))?;

        let allowed_origins = parse_origins(
            &std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
        );

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret,
            allowed_origins,
            sync_interval_secs: std::env::var("SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
