use crate::error::ClientError;
use log::info;
use std::env;
use std::time::Duration;

/// Application configuration for the resilient client layer.
///
/// Every knob has a default matching the remote API's published limits
/// (1000 requests/minute) so a bare environment still produces a usable
/// client; only the OAuth2 credentials are mandatory.
#[derive(Debug, Clone)]
pub struct Config {
    // Remote GraphQL backend
    pub api_base_url: String,
    pub api_endpoints: Vec<String>,
    pub user_agent: String,

    // OAuth2 token endpoint
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub oauth_scope: String,

    // Shared store (distributed cache tier + rate-limit counter)
    pub redis_url: Option<String>,

    // Rate limiter
    pub requests_per_minute: u32,
    pub requests_per_second: u32,
    pub burst_size: u32,

    // Circuit breaker defaults
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,

    // Connection pool
    pub read_timeout_secs: u64,
    pub request_retries: u32,

    // Batch processor
    pub batch_size: usize,
    pub max_parallel: usize,
    pub queue_size: usize,

    // Cache
    pub cache_default_ttl_secs: u64,
    pub cache_max_memory_items: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "https://api.soundtrackyourbrand.com/v2".to_string()),
            api_endpoints: env::var("API_ENDPOINTS")
                .ok()
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or_default(),
            user_agent: env::var("API_USER_AGENT")
                .unwrap_or_else(|_| "zone-client/0.1".to_string()),
            client_id: env::var("API_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("API_CLIENT_SECRET").unwrap_or_default(),
            token_url: env::var("API_TOKEN_URL")
                .unwrap_or_else(|_| "https://api.soundtrackyourbrand.com/oauth/token".to_string()),
            oauth_scope: env::var("API_OAUTH_SCOPE")
                .unwrap_or_else(|_| "zones.read zones.write playlists.read volume.write".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
            requests_per_minute: env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            requests_per_second: env::var("RATE_LIMIT_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            burst_size: env::var("RATE_LIMIT_BURST_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            failure_threshold: env::var("BREAKER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            recovery_timeout_secs: env::var("BREAKER_RECOVERY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            success_threshold: env::var("BREAKER_SUCCESS_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            read_timeout_secs: env::var("POOL_READ_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            request_retries: env::var("POOL_REQUEST_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            batch_size: env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            max_parallel: env::var("BATCH_MAX_PARALLEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            queue_size: env::var("BATCH_QUEUE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            cache_default_ttl_secs: env::var("CACHE_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            cache_max_memory_items: env::var("CACHE_MAX_MEMORY_ITEMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ClientError::Config(
                "API_CLIENT_ID and API_CLIENT_SECRET must be set".to_string(),
            ));
        }
        if self.requests_per_minute == 0 || self.requests_per_second == 0 {
            return Err(ClientError::Config(
                "rate limits must be non-zero".to_string(),
            ));
        }
        if self.batch_size == 0 || self.max_parallel == 0 {
            return Err(ClientError::Config(
                "batch size and parallelism must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn log_settings(&self) {
        info!(
            "Client config: base_url={}, rpm={}, rps={}, burst={}, batch_size={}, parallel={}, redis={}",
            self.api_base_url,
            self.requests_per_minute,
            self.requests_per_second,
            self.burst_size,
            self.batch_size,
            self.max_parallel,
            if self.redis_url.is_some() { "enabled" } else { "disabled" },
        );
    }
}
