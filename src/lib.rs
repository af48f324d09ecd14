pub mod auth;
pub mod batch;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod pool;

// Re-export the composed client surface
pub use client::{ClientMetrics, ZoneApiClient, ZoneBatchOutcome, ZoneCommand};

// Re-export the building blocks for embedders that wire their own stack
pub use auth::{AccessToken, HttpTokenTransport, TokenManager, TokenTransport};
pub use batch::{
    AdaptiveBatchSize, BatchConfig, BatchPriority, BatchProcessor, BatchSizeStrategy,
    FixedBatchSize, ItemOutcome, JobResult, JobStatus,
};
pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitState, MultiCircuitBreaker,
};
pub use cache::{CacheConfig, CacheManager, InvalidationObserver};
pub use config::{load_config, Config};
pub use error::ClientError;
pub use limiter::{DistributedRateLimiter, RateLimiter, RateLimiterConfig};
pub use pool::{ConnectionPoolManager, LoadBalancedPool, PoolConfig};
