use thiserror::Error;

/// Error taxonomy for the resilient client layer.
///
/// Rate-limit waits are deliberately absent: the limiter waits cooperatively
/// instead of surfacing an error. Cache backend failures are logged and
/// degraded to misses inside `CacheManager`; the variant exists for the rare
/// call sites that talk to the shared store directly.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Token refresh exhausted all retries
    #[error("Auth Error: {0}")]
    Auth(String),

    /// Call rejected without attempting the network; back off until the
    /// breaker's recovery time
    #[error("Circuit breaker is open, operation blocked: {0}")]
    CircuitOpen(String),

    /// Network/timeout/non-2xx during an attempt
    #[error("Transport Error: {0}")]
    Transport(String),

    /// An explicit wait deadline elapsed (job waits, health checks)
    #[error("Timeout Error: {0}")]
    Timeout(String),

    /// Bounded queue or concurrency limit refused the work
    #[error("Resource Exhausted: {0}")]
    ResourceExhausted(String),

    /// A batch job's processor failed; recorded on that job only
    #[error("Batch Error: {0}")]
    Batch(String),

    /// Shared cache tier operation failed
    #[error("Cache Backend Error: {0}")]
    CacheBackend(String),

    /// Malformed payload from the remote API or the cache
    #[error("Parse Error: {0}")]
    Parse(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Parse(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(format!("HTTP request timed out: {}", err))
        } else {
            ClientError::Transport(format!("HTTP error: {}", err))
        }
    }
}

impl From<redis::RedisError> for ClientError {
    fn from(err: redis::RedisError) -> Self {
        ClientError::CacheBackend(format!("Redis error: {}", err))
    }
}

impl ClientError {
    /// Determines if an error is recoverable by retrying later.
    ///
    /// Consumers treat `CircuitOpen` and `Auth` as retryable-later
    /// conditions, not fatal ones.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Auth(_) => true, // Token endpoint may recover
            ClientError::CircuitOpen(_) => true, // Retry after recovery_timeout
            ClientError::Transport(_) => true,
            ClientError::Timeout(_) => true,
            ClientError::ResourceExhausted(_) => true, // Queue drains over time
            ClientError::Batch(_) => true,
            ClientError::CacheBackend(_) => true, // Redis might recover
            ClientError::Parse(_) => false, // Data format issues aren't recoverable
            ClientError::Config(_) => false, // Config needs fixing
        }
    }

    /// Whether an immediate retry (same call site, after backoff) is sensible.
    /// `CircuitOpen` is recoverable later but must not be retried immediately.
    pub fn should_retry(&self) -> bool {
        self.is_recoverable()
            && !matches!(
                self,
                ClientError::CircuitOpen(_) | ClientError::Auth(_) | ClientError::ResourceExhausted(_)
            )
    }
}
