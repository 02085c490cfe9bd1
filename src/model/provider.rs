use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::query::{AssetKind, Market, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub assets: Vec<AssetKind>,
    pub markets: Vec<Market>,
    pub timeframes: Vec<Timeframe>,
    pub max_symbols_per_request: usize,
    pub supports_real_time: bool,
    pub supports_historical: bool,
    pub data_delay_seconds: u32,
    pub max_history_days: Option<u32>,
}

/// Auth configuration. `headers()` materializes the HTTP header set a
/// provider should send; `is_valid()` is the validity predicate from the
/// spec (non-empty credentials / unexpired token).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    ApiKey { api_key: String },
    BearerToken { token: String },
    BasicAuth { user: String, pass: String },
    OAuth2 {
        client_id: String,
        client_secret: String,
        access_token: Option<String>,
    },
}

impl AuthConfig {
    pub fn is_valid(&self) -> bool {
        match self {
            AuthConfig::None => true,
            AuthConfig::ApiKey { api_key } => !api_key.is_empty(),
            AuthConfig::BearerToken { token } => !token.is_empty(),
            AuthConfig::BasicAuth { user, pass } => !user.is_empty() && !pass.is_empty(),
            AuthConfig::OAuth2 {
                client_id,
                client_secret,
                ..
            } => !client_id.is_empty() && !client_secret.is_empty(),
        }
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        match self {
            AuthConfig::None => {}
            AuthConfig::ApiKey { api_key } => {
                headers.insert("X-Api-Key".to_string(), api_key.clone());
            }
            AuthConfig::BearerToken { token } => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            AuthConfig::BasicAuth { user, pass } => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                let encoded = STANDARD.encode(format!("{user}:{pass}"));
                headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
            }
            AuthConfig::OAuth2 { access_token, .. } => {
                if let Some(token) = access_token {
                    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                }
            }
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub concurrent_requests: usize,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl RateLimitConfig {
    pub fn min_delay_seconds(&self) -> f64 {
        60.0 / self.requests_per_minute as f64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 2000,
            concurrent_requests: 4,
            backoff_factor: 2.0,
            max_retries: 3,
        }
    }
}
