// src/client.rs
//! High-level GraphQL client for zone control, composing the resilience
//! layers: OAuth2 token management, rate limiting, per-operation circuit
//! breaking, pooled HTTP transport, two-tier caching and batch execution.
//!
//! Every request flows limiter -> breaker -> pool; responses feed back
//! into the adaptive limiter. Reads go through the cache, mutations
//! invalidate the affected zone's entries.

use crate::auth::{AuthMetrics, HttpTokenTransport, TokenManager};
use crate::batch::{
    BatchConfig, BatchFn, BatchMetrics, BatchPriority, BatchProcessor, BatchSizeStrategy,
    FixedBatchSize, ItemOutcome,
};
use crate::breaker::{CircuitBreakerConfig, CircuitBreakerMetrics, MultiCircuitBreaker};
use crate::cache::{CacheConfig, CacheManager, CacheStats};
use crate::config::Config;
use crate::error::ClientError;
use crate::limiter::{RateLimiter, RateLimiterConfig, RateLimiterUsage};
use crate::pool::{ConnectionPoolManager, PoolConfig, PoolStats};
use futures::FutureExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PRIORITY_READ: u8 = 5;
const PRIORITY_MUTATION: u8 = 8;
const PRIORITY_HEALTH: u8 = 2;

const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);
const INFO_CACHE_TTL: Duration = Duration::from_secs(300);
const PLAYLIST_CACHE_TTL: Duration = Duration::from_secs(3600);
const BATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

const ZONE_STATUS_QUERY: &str = r#"
query ZoneStatus($zoneId: ID!) {
  soundZone(id: $zoneId) {
    id
    isPaused
    playback { state volume }
    nowPlaying { track { name artists { name } } }
  }
}"#;

const ZONE_INFO_QUERY: &str = r#"
query ZoneInfo($zoneId: ID!) {
  soundZone(id: $zoneId) {
    id
    name
    device { id name }
    location { id name }
    account { id businessName }
  }
}"#;

const SET_VOLUME_MUTATION: &str = r#"
mutation SetVolume($zoneId: ID!, $volume: Int!) {
  setVolume(input: { soundZone: $zoneId, volume: $volume }) { volume }
}"#;

const PLAY_MUTATION: &str = r#"
mutation Play($zoneId: ID!) {
  play(input: { soundZone: $zoneId }) { status }
}"#;

const PAUSE_MUTATION: &str = r#"
mutation Pause($zoneId: ID!) {
  pause(input: { soundZone: $zoneId }) { status }
}"#;

const SKIP_TRACK_MUTATION: &str = r#"
mutation SkipTrack($zoneId: ID!) {
  skipTrack(input: { soundZone: $zoneId }) { status }
}"#;

const PLAYLISTS_QUERY: &str = r#"
query Playlists($location: ID) {
  playlists(location: $location) {
    edges { node { id name trackCount } }
  }
}"#;

const PLAYLIST_QUERY: &str = r#"
query Playlist($playlistId: ID!) {
  playlist(id: $playlistId) {
    id
    name
    description
    trackCount
    duration
  }
}"#;

const SET_PLAYLIST_MUTATION: &str = r#"
mutation SetPlaylist($zoneId: ID!, $playlistId: ID!) {
  setPlaylist(input: { soundZone: $zoneId, playlist: $playlistId }) { status }
}"#;

const HEALTH_QUERY: &str = r#"query Health { me { ... on PublicAPIClient { id } } }"#;

/// One unit of work in a zone batch.
#[derive(Debug, Clone)]
pub enum ZoneCommand {
    Status { zone_id: String },
    SetVolume { zone_id: String, volume: u8 },
}

impl ZoneCommand {
    fn zone_id(&self) -> &str {
        match self {
            ZoneCommand::Status { zone_id } => zone_id,
            ZoneCommand::SetVolume { zone_id, .. } => zone_id,
        }
    }
}

/// Per-zone result of a batch operation.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneBatchOutcome {
    pub zone_id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    pub auth: AuthMetrics,
    pub rate_limiter: RateLimiterUsage,
    pub breakers: Vec<(String, CircuitBreakerMetrics)>,
    pub pools: PoolStats,
    pub cache: CacheStats,
    pub batch: BatchMetrics,
}

/// Shared execution core. Cheap to clone into batch processor closures.
struct ClientCore {
    config: Arc<Config>,
    tokens: Arc<TokenManager>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<MultiCircuitBreaker>,
    pools: Arc<ConnectionPoolManager>,
    cache: Arc<CacheManager>,
}

impl ClientCore {
    /// Runs one GraphQL operation through the full pipeline and returns the
    /// response's `data` field.
    async fn execute(
        &self,
        operation_name: &str,
        query: &str,
        variables: Value,
        priority: u8,
    ) -> Result<Value, ClientError> {
        let waited = self.limiter.acquire(priority).await;
        if waited > Duration::from_secs(1) {
            debug!("{} delayed {:.2}s by rate limiter", operation_name, waited.as_secs_f64());
        }

        let url = format!("{}/graphql", self.config.api_base_url.trim_end_matches('/'));
        let body = json!({ "query": query, "variables": variables });
        let auth_header = self.tokens.authorization_header().await?;
        let pools = self.pools.clone();
        let tokens = self.tokens.clone();

        let start = Instant::now();
        let result = self
            .breakers
            .call(operation_name, move || {
                let url = url;
                let body = body;
                let auth_header = auth_header;
                async move {
                    let response = pools
                        .execute_request(
                            reqwest::Method::POST,
                            &url,
                            &[("Authorization".to_string(), auth_header)],
                            Some(&body),
                        )
                        .await?;

                    let status = response.status();
                    if status.as_u16() == 401 {
                        // Force a refresh on the next call.
                        tokens.invalidate().await;
                        return Err(ClientError::Auth(
                            "access token rejected by backend".to_string(),
                        ));
                    }
                    if status.as_u16() == 429 {
                        return Err(ClientError::Transport(
                            "rate limited by backend (429)".to_string(),
                        ));
                    }
                    if !status.is_success() {
                        return Err(ClientError::Transport(format!(
                            "backend returned HTTP {}",
                            status
                        )));
                    }

                    let payload: Value = response.json().await?;
                    if let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) {
                        if !errors.is_empty() {
                            return Err(ClientError::Transport(format!(
                                "GraphQL errors: {}",
                                Value::Array(errors.clone())
                            )));
                        }
                    }
                    Ok(payload.get("data").cloned().unwrap_or(Value::Null))
                }
            })
            .await;

        self.limiter
            .report_response(start.elapsed(), result.is_ok())
            .await;
        result
    }

    async fn zone_status(&self, zone_id: &str) -> Result<Value, ClientError> {
        let key = self.cache.cache_key("zone_status", zone_id, None);
        self.cache
            .get_or_set(&key, Some(STATUS_CACHE_TTL), || {
                self.execute(
                    "zone_status",
                    ZONE_STATUS_QUERY,
                    json!({ "zoneId": zone_id }),
                    PRIORITY_READ,
                )
            })
            .await
    }

    async fn set_volume(&self, zone_id: &str, volume: u8) -> Result<Value, ClientError> {
        if volume > 100 {
            return Err(ClientError::Config(format!(
                "volume {} out of range 0..=100",
                volume
            )));
        }
        let data = self
            .execute(
                "set_volume",
                SET_VOLUME_MUTATION,
                json!({ "zoneId": zone_id, "volume": volume }),
                PRIORITY_MUTATION,
            )
            .await?;
        self.invalidate_zone(zone_id).await;
        Ok(data)
    }

    /// Drops cached state for a zone after a mutation.
    async fn invalidate_zone(&self, zone_id: &str) {
        let removed = self
            .cache
            .delete_pattern(&format!("zone_status:{}", zone_id))
            .await;
        if removed > 0 {
            debug!("Invalidated {} cached entries for zone {}", removed, zone_id);
        }
    }
}

fn batch_command_processor(core: Arc<ClientCore>) -> BatchFn<ZoneCommand> {
    Arc::new(move |commands: Vec<ZoneCommand>| {
        let core = core.clone();
        async move {
            let mut outcomes = Vec::with_capacity(commands.len());
            for command in commands {
                let zone_id = command.zone_id().to_string();
                let result = match &command {
                    ZoneCommand::Status { zone_id } => core.zone_status(zone_id).await,
                    ZoneCommand::SetVolume { zone_id, volume } => {
                        core.set_volume(zone_id, *volume).await
                    }
                };
                outcomes.push(match result {
                    Ok(data) => {
                        ItemOutcome::ok(Some(json!({ "zoneId": zone_id, "data": data })))
                    }
                    Err(e) => {
                        warn!("Batch command for zone {} failed: {}", zone_id, e);
                        ItemOutcome {
                            success: false,
                            data: Some(json!({ "zoneId": zone_id })),
                            error: Some(e.to_string()),
                        }
                    }
                });
            }
            Ok(outcomes)
        }
        .boxed()
    })
}

/// Facade over the composed pipeline. All components are injected; the
/// convenience constructor wires the production set from `Config`.
pub struct ZoneApiClient {
    core: Arc<ClientCore>,
    batch: Arc<BatchProcessor<ZoneCommand>>,
    command_processor: BatchFn<ZoneCommand>,
}

impl ZoneApiClient {
    pub fn new(config: Arc<Config>, redis: Option<ConnectionManager>) -> Self {
        let transport = Arc::new(HttpTokenTransport::new(
            &config.token_url,
            &config.client_id,
            &config.client_secret,
            &config.oauth_scope,
        ));
        let tokens = Arc::new(TokenManager::new(transport));

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_minute: config.requests_per_minute,
            requests_per_second: config.requests_per_second,
            burst_size: config.burst_size,
            enable_adaptive: true,
        }));

        let breakers = Arc::new(MultiCircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            success_threshold: config.success_threshold,
            ..CircuitBreakerConfig::default()
        }));

        let pools = Arc::new(ConnectionPoolManager::new(PoolConfig {
            read_timeout: config.read_timeout(),
            retries: config.request_retries,
            user_agent: config.user_agent.clone(),
            ..PoolConfig::default()
        }));

        let cache = Arc::new(CacheManager::new(
            CacheConfig {
                default_ttl: Duration::from_secs(config.cache_default_ttl_secs),
                max_memory_items: config.cache_max_memory_items,
                ..CacheConfig::default()
            },
            redis,
        ));

        let batch_config = BatchConfig {
            max_parallel: config.max_parallel,
            queue_size: config.queue_size,
            ..BatchConfig::default()
        };
        let strategy: Arc<dyn BatchSizeStrategy> = Arc::new(FixedBatchSize(config.batch_size));

        Self::from_parts(config, tokens, limiter, breakers, pools, cache, batch_config, strategy)
    }

    /// Full dependency injection, used by tests and embedders that need to
    /// substitute components.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: Arc<Config>,
        tokens: Arc<TokenManager>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<MultiCircuitBreaker>,
        pools: Arc<ConnectionPoolManager>,
        cache: Arc<CacheManager>,
        batch_config: BatchConfig,
        strategy: Arc<dyn BatchSizeStrategy>,
    ) -> Self {
        let core = Arc::new(ClientCore {
            config,
            tokens,
            limiter,
            breakers,
            pools,
            cache,
        });
        let batch = Arc::new(BatchProcessor::new(batch_config, strategy));
        let command_processor = batch_command_processor(core.clone());
        Self {
            core,
            batch,
            command_processor,
        }
    }

    /// Starts the background machinery: pool reaper and batch workers.
    pub async fn start(&self) {
        self.core.pools.start().await;
        self.batch.start().await;
        info!("Zone API client started");
    }

    /// Stops background tasks. In-flight batch jobs complete first.
    pub async fn stop(&self) {
        self.batch.stop().await;
        self.core.pools.stop().await;
        info!("Zone API client stopped");
    }

    /// Raw GraphQL escape hatch for operations the typed surface does not
    /// cover.
    pub async fn execute(
        &self,
        operation_name: &str,
        query: &str,
        variables: Value,
        priority: u8,
    ) -> Result<Value, ClientError> {
        self.core
            .execute(operation_name, query, variables, priority)
            .await
    }

    /// Current playback status for one zone, cached for 60 seconds.
    pub async fn zone_status(&self, zone_id: &str) -> Result<Value, ClientError> {
        self.core.zone_status(zone_id).await
    }

    /// Static zone details (device, location, account), cached for
    /// 5 minutes.
    pub async fn zone_info(&self, zone_id: &str) -> Result<Value, ClientError> {
        let key = self.core.cache.cache_key("zone_info", zone_id, None);
        let core = &self.core;
        core.cache
            .get_or_set(&key, Some(INFO_CACHE_TTL), || {
                core.execute(
                    "zone_info",
                    ZONE_INFO_QUERY,
                    json!({ "zoneId": zone_id }),
                    PRIORITY_READ,
                )
            })
            .await
    }

    pub async fn set_volume(&self, zone_id: &str, volume: u8) -> Result<Value, ClientError> {
        self.core.set_volume(zone_id, volume).await
    }

    pub async fn play(&self, zone_id: &str) -> Result<Value, ClientError> {
        let data = self
            .core
            .execute(
                "play",
                PLAY_MUTATION,
                json!({ "zoneId": zone_id }),
                PRIORITY_MUTATION,
            )
            .await?;
        self.core.invalidate_zone(zone_id).await;
        Ok(data)
    }

    pub async fn pause(&self, zone_id: &str) -> Result<Value, ClientError> {
        let data = self
            .core
            .execute(
                "pause",
                PAUSE_MUTATION,
                json!({ "zoneId": zone_id }),
                PRIORITY_MUTATION,
            )
            .await?;
        self.core.invalidate_zone(zone_id).await;
        Ok(data)
    }

    pub async fn skip_track(&self, zone_id: &str) -> Result<Value, ClientError> {
        let data = self
            .core
            .execute(
                "skip_track",
                SKIP_TRACK_MUTATION,
                json!({ "zoneId": zone_id }),
                PRIORITY_MUTATION,
            )
            .await?;
        self.core.invalidate_zone(zone_id).await;
        Ok(data)
    }

    /// Available playlists, optionally filtered by location. Playlists
    /// change rarely, so they are cached for an hour.
    pub async fn playlists(&self, location: Option<&str>) -> Result<Value, ClientError> {
        let key = self
            .core
            .cache
            .cache_key("playlists", location.unwrap_or("all"), None);
        let core = &self.core;
        core.cache
            .get_or_set(&key, Some(PLAYLIST_CACHE_TTL), || {
                core.execute(
                    "playlists",
                    PLAYLISTS_QUERY,
                    json!({ "location": location }),
                    PRIORITY_READ,
                )
            })
            .await
    }

    /// Details for one playlist, cached for an hour.
    pub async fn playlist(&self, playlist_id: &str) -> Result<Value, ClientError> {
        let key = self.core.cache.cache_key("playlist", playlist_id, None);
        let core = &self.core;
        core.cache
            .get_or_set(&key, Some(PLAYLIST_CACHE_TTL), || {
                core.execute(
                    "playlist",
                    PLAYLIST_QUERY,
                    json!({ "playlistId": playlist_id }),
                    PRIORITY_READ,
                )
            })
            .await
    }

    /// Switches a zone to another playlist and invalidates its cached
    /// status.
    pub async fn set_playlist(
        &self,
        zone_id: &str,
        playlist_id: &str,
    ) -> Result<Value, ClientError> {
        let data = self
            .core
            .execute(
                "set_playlist",
                SET_PLAYLIST_MUTATION,
                json!({ "zoneId": zone_id, "playlistId": playlist_id }),
                PRIORITY_MUTATION,
            )
            .await?;
        self.core.invalidate_zone(zone_id).await;
        Ok(data)
    }

    /// Fetches status for many zones through the batch queue. Zones whose
    /// job failed or timed out come back with `success = false`.
    pub async fn batch_zone_status(
        &self,
        zone_ids: Vec<String>,
    ) -> Result<Vec<ZoneBatchOutcome>, ClientError> {
        let commands = zone_ids
            .iter()
            .map(|zone_id| ZoneCommand::Status {
                zone_id: zone_id.clone(),
            })
            .collect();
        self.run_zone_batch(commands, zone_ids, BatchPriority::Normal, "status")
            .await
    }

    /// Applies volume changes to many zones through the batch queue.
    pub async fn batch_set_volume(
        &self,
        changes: Vec<(String, u8)>,
    ) -> Result<Vec<ZoneBatchOutcome>, ClientError> {
        let zone_ids: Vec<String> = changes.iter().map(|(id, _)| id.clone()).collect();
        let commands = changes
            .into_iter()
            .map(|(zone_id, volume)| ZoneCommand::SetVolume { zone_id, volume })
            .collect();
        self.run_zone_batch(commands, zone_ids, BatchPriority::High, "volume")
            .await
    }

    async fn run_zone_batch(
        &self,
        commands: Vec<ZoneCommand>,
        zone_ids: Vec<String>,
        priority: BatchPriority,
        id_prefix: &str,
    ) -> Result<Vec<ZoneBatchOutcome>, ClientError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let job_ids = self
            .batch
            .submit_bulk(commands, self.command_processor.clone(), priority, id_prefix)
            .await?;
        let results = self.batch.wait_for_all(&job_ids, BATCH_WAIT_TIMEOUT).await;

        let mut outcomes = Vec::with_capacity(zone_ids.len());
        let mut reported: HashSet<String> = HashSet::new();
        let mut job_errors: Vec<String> = Vec::new();

        for result in &results {
            if let Some(error) = &result.error {
                job_errors.push(error.clone());
            }
            for outcome in &result.outcomes {
                let zone_id = outcome
                    .data
                    .as_ref()
                    .and_then(|d| d.get("zoneId"))
                    .and_then(|z| z.as_str())
                    .unwrap_or_default()
                    .to_string();
                reported.insert(zone_id.clone());
                outcomes.push(ZoneBatchOutcome {
                    zone_id,
                    success: outcome.success,
                    data: outcome
                        .data
                        .as_ref()
                        .and_then(|d| d.get("data"))
                        .cloned(),
                    error: outcome.error.clone(),
                });
            }
        }

        // Zones from jobs that errored or timed out produced no outcome.
        let fallback_error = job_errors.join("; ");
        for zone_id in zone_ids {
            if !reported.contains(&zone_id) {
                outcomes.push(ZoneBatchOutcome {
                    zone_id,
                    success: false,
                    data: None,
                    error: Some(if fallback_error.is_empty() {
                        "batch job did not report an outcome".to_string()
                    } else {
                        fallback_error.clone()
                    }),
                });
            }
        }
        Ok(outcomes)
    }

    /// Lightweight end-to-end probe through the full pipeline.
    pub async fn health_check(&self) -> bool {
        match self
            .core
            .execute("health", HEALTH_QUERY, json!({}), PRIORITY_HEALTH)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.core.cache
    }

    pub fn batch_processor(&self) -> &Arc<BatchProcessor<ZoneCommand>> {
        &self.batch
    }

    pub async fn metrics(&self) -> ClientMetrics {
        ClientMetrics {
            auth: self.core.tokens.metrics().await,
            rate_limiter: self.core.limiter.usage().await,
            breakers: self.core.breakers.all_metrics().await,
            pools: self.core.pools.pool_stats().await,
            cache: self.core.cache.stats().await,
            batch: self.batch.metrics().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zone_commands_expose_their_zone() {
        let status = ZoneCommand::Status {
            zone_id: "z1".to_string(),
        };
        let volume = ZoneCommand::SetVolume {
            zone_id: "z2".to_string(),
            volume: 40,
        };
        assert_eq!(status.zone_id(), "z1");
        assert_eq!(volume.zone_id(), "z2");
    }

    #[tokio::test]
    async fn volume_outside_range_is_rejected_before_any_request() {
        let config = Arc::new(Config::from_env());
        let client = ZoneApiClient::new(config, None);

        let err = client.set_volume("z1", 101).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn playlist_reads_are_served_from_cache() {
        let config = Arc::new(Config::from_env());
        let client = ZoneApiClient::new(config, None);

        let key = client.cache().cache_key("playlists", "all", None);
        client
            .cache()
            .set(&key, json!({"edges": [{"node": {"id": "p1"}}]}), None)
            .await;
        let playlists = client.playlists(None).await.unwrap();
        assert_eq!(playlists["edges"][0]["node"]["id"], "p1");

        let key = client.cache().cache_key("playlist", "p1", None);
        client
            .cache()
            .set(&key, json!({"id": "p1", "name": "Lounge"}), None)
            .await;
        let playlist = client.playlist("p1").await.unwrap();
        assert_eq!(playlist["name"], "Lounge");

        // Location-filtered listings get their own cache key.
        assert_ne!(
            client.cache().cache_key("playlists", "loc-1", None),
            client.cache().cache_key("playlists", "all", None)
        );
    }

    #[tokio::test]
    async fn empty_batch_returns_no_outcomes() {
        let config = Arc::new(Config::from_env());
        let client = ZoneApiClient::new(config, None);

        let outcomes = client.batch_zone_status(Vec::new()).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
