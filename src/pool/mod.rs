// src/pool/mod.rs
//! Per-host HTTP connection pooling with idle reaping and health/latency
//! bookkeeping.
//!
//! One reusable keep-alive client per remote host, created lazily behind a
//! per-host lock (double-checked so a burst of first-use calls builds one
//! pool, not many). A background reaper tears down pools with no traffic
//! past the idle threshold so resource use stays bounded when talking to
//! many distinct hosts.

use crate::error::ClientError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retries: u32,
    pub user_agent: String,
    pub idle_threshold: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 50,
            keepalive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            retries: 3,
            user_agent: "zone-client/0.1".to_string(),
            idle_threshold: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

struct HostStats {
    last_used: Instant,
    requests: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
}

/// Per-host entry: one reusable client plus traffic bookkeeping.
struct HostPool {
    client: reqwest::Client,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    stats: Mutex<HostStats>,
}

/// Per-host statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HostPoolStats {
    pub host: String,
    pub requests: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub idle_secs: u64,
    pub age_minutes: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_pools: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub connection_reuse_count: u64,
    pub hosts: Vec<HostPoolStats>,
}

struct PoolInner {
    config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<HostPool>>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    reuse_count: AtomicU64,
}

pub struct ConnectionPoolManager {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                pools: RwLock::new(HashMap::new()),
                creation_locks: DashMap::new(),
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                reuse_count: AtomicU64::new(0),
            }),
            reaper: Mutex::new(None),
        }
    }

    /// Starts the idle-pool reaper. Safe to call once per manager.
    pub async fn start(&self) {
        let mut guard = self.reaper.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let interval = inner.config.reap_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                Self::prune_idle_inner(&inner).await;
            }
        }));
        info!(
            "Connection pool manager started (reap every {}s, idle threshold {}s)",
            self.inner.config.reap_interval.as_secs(),
            self.inner.config.idle_threshold.as_secs()
        );
    }

    /// Stops the reaper and drops every host pool. No background task is
    /// left behind.
    pub async fn stop(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        let mut pools = self.inner.pools.write().await;
        for host in pools.keys() {
            debug!("Closed connection pool for {}", host);
        }
        pools.clear();
        info!("Connection pool manager stopped");
    }

    /// Returns the pooled, keep-alive client for `base_url`, creating it on
    /// first use. Creation is serialized per host with a double-check.
    pub async fn client_for(&self, base_url: &str) -> Result<reqwest::Client, ClientError> {
        if let Some(pool) = self.inner.pools.read().await.get(base_url) {
            self.inner.reuse_count.fetch_add(1, Ordering::Relaxed);
            return Ok(pool.client.clone());
        }

        let lock = self
            .inner
            .creation_locks
            .entry(base_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-check after acquiring the per-host lock.
        if let Some(pool) = self.inner.pools.read().await.get(base_url) {
            self.inner.reuse_count.fetch_add(1, Ordering::Relaxed);
            return Ok(pool.client.clone());
        }

        let pool = Arc::new(self.build_pool()?);
        let client = pool.client.clone();
        self.inner
            .pools
            .write()
            .await
            .insert(base_url.to_string(), pool);
        info!("Created connection pool for {}", base_url);
        Ok(client)
    }

    fn build_pool(&self) -> Result<HostPool, ClientError> {
        let config = &self.inner.config;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_idle_timeout(config.keepalive)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(HostPool {
            client,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            stats: Mutex::new(HostStats {
                last_used: Instant::now(),
                requests: 0,
                failures: 0,
                latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
        })
    }

    /// Executes one HTTP request with up to `retries` attempts and
    /// 2^attempt-second backoff, updating per-host stats after every
    /// attempt. Non-2xx statuses are returned to the caller; only transport
    /// errors are retried here.
    pub async fn execute_request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &[(String, String)],
        json_body: Option<&Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let host_key = host_key(url)?;
        let retries = self.inner.config.retries.max(1);
        let mut last_error = None;

        for attempt in 0..retries {
            let client = self.client_for(&host_key).await?;
            let start = Instant::now();

            let mut request = client.request(method.clone(), url);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(body) = json_body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    self.record_outcome(&host_key, true, Some(start.elapsed()))
                        .await;
                    return Ok(response);
                }
                Err(e) => {
                    self.record_outcome(&host_key, false, None).await;
                    let err = ClientError::from(e);
                    if attempt + 1 < retries {
                        let backoff = Duration::from_secs(1 << attempt);
                        warn!(
                            "Request to {} failed (attempt {}/{}): {}. Retrying in {:?}",
                            host_key,
                            attempt + 1,
                            retries,
                            err,
                            backoff
                        );
                        sleep(backoff).await;
                    } else {
                        error!(
                            "Request to {} failed after {} attempts: {}",
                            host_key, retries, err
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::Transport("request failed".to_string())))
    }

    async fn record_outcome(&self, host: &str, success: bool, latency: Option<Duration>) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(pool) = self.inner.pools.read().await.get(host) {
            let mut stats = pool.stats.lock().await;
            stats.requests += 1;
            stats.last_used = Instant::now();
            if !success {
                stats.failures += 1;
            }
            if let Some(latency) = latency {
                if stats.latencies.len() == LATENCY_SAMPLES {
                    stats.latencies.pop_front();
                }
                stats.latencies.push_back(latency);
            }
        }
    }

    /// Drops host pools idle longer than the configured threshold.
    pub async fn prune_idle(&self) {
        Self::prune_idle_inner(&self.inner).await;
    }

    async fn prune_idle_inner(inner: &PoolInner) {
        let threshold = inner.config.idle_threshold;
        let mut stale = Vec::new();
        {
            let pools = inner.pools.read().await;
            for (host, pool) in pools.iter() {
                let idle = pool.stats.lock().await.last_used.elapsed();
                if idle > threshold {
                    stale.push(host.clone());
                }
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut pools = inner.pools.write().await;
        for host in stale {
            if pools.remove(&host).is_some() {
                inner.creation_locks.remove(&host);
                info!("Reaped idle connection pool for {}", host);
            }
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        let pools = self.inner.pools.read().await;
        let mut hosts = Vec::with_capacity(pools.len());
        for (host, pool) in pools.iter() {
            let stats = pool.stats.lock().await;
            let average_latency_ms = if stats.latencies.is_empty() {
                0.0
            } else {
                stats.latencies.iter().map(|d| d.as_secs_f64()).sum::<f64>()
                    / stats.latencies.len() as f64
                    * 1000.0
            };
            hosts.push(HostPoolStats {
                host: host.clone(),
                requests: stats.requests,
                failures: stats.failures,
                failure_rate: stats.failures as f64 / stats.requests.max(1) as f64,
                average_latency_ms,
                idle_secs: stats.last_used.elapsed().as_secs(),
                age_minutes: pool.created_at.elapsed().as_secs_f64() / 60.0,
                created_at: pool.created_wall,
            });
        }

        PoolStats {
            total_pools: pools.len(),
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            failed_requests: self.inner.failed_requests.load(Ordering::Relaxed),
            connection_reuse_count: self.inner.reuse_count.load(Ordering::Relaxed),
            hosts,
        }
    }

    /// Probe one host; healthy means a response with status < 500.
    pub async fn health_check(&self, base_url: &str, path: &str) -> bool {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        match self
            .execute_request(reqwest::Method::GET, &url, &[], None)
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                error!("Health check failed for {}: {}", base_url, e);
                false
            }
        }
    }
}

/// scheme://host[:port] key for pool selection and stats.
fn host_key(raw: &str) -> Result<String, ClientError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ClientError::Parse(format!("invalid url {}: {}", raw, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::Parse(format!("url has no host: {}", raw)))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

struct EndpointState {
    healthy: bool,
    last_latency: Option<Duration>,
}

/// Round-robin load balancing over one `ConnectionPoolManager` per declared
/// endpoint, skipping endpoints whose most recent call failed. When every
/// endpoint is unhealthy it falls back to the first one rather than
/// refusing outright.
pub struct LoadBalancedPool {
    endpoints: Vec<String>,
    pools: Vec<Arc<ConnectionPoolManager>>,
    next: Mutex<usize>,
    states: RwLock<Vec<EndpointState>>,
}

impl LoadBalancedPool {
    pub fn new(endpoints: Vec<String>, config: PoolConfig) -> Self {
        let pools = endpoints
            .iter()
            .map(|_| Arc::new(ConnectionPoolManager::new(config.clone())))
            .collect();
        let states = endpoints
            .iter()
            .map(|_| EndpointState {
                healthy: true,
                last_latency: None,
            })
            .collect();

        Self {
            endpoints,
            pools,
            next: Mutex::new(0),
            states: RwLock::new(states),
        }
    }

    pub async fn start(&self) {
        for pool in &self.pools {
            pool.start().await;
        }
    }

    pub async fn stop(&self) {
        for pool in &self.pools {
            pool.stop().await;
        }
    }

    async fn select(&self) -> usize {
        let mut next = self.next.lock().await;
        let states = self.states.read().await;
        for _ in 0..self.endpoints.len() {
            let idx = *next % self.endpoints.len();
            *next = (*next + 1) % self.endpoints.len();
            if states[idx].healthy {
                return idx;
            }
        }
        // All unhealthy: first endpoint rather than refusing.
        0
    }

    pub async fn execute_request(
        &self,
        method: reqwest::Method,
        path: &str,
        headers: &[(String, String)],
        json_body: Option<&Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let idx = self.select().await;
        let endpoint = &self.endpoints[idx];
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let start = Instant::now();

        match self.pools[idx]
            .execute_request(method, &url, headers, json_body)
            .await
        {
            Ok(response) => {
                let mut states = self.states.write().await;
                states[idx].healthy = true;
                states[idx].last_latency = Some(start.elapsed());
                Ok(response)
            }
            Err(e) => {
                self.states.write().await[idx].healthy = false;
                warn!("Endpoint {} marked unhealthy: {}", endpoint, e);
                Err(e)
            }
        }
    }

    pub async fn endpoint_health(&self) -> Vec<(String, bool, Option<Duration>)> {
        let states = self.states.read().await;
        self.endpoints
            .iter()
            .zip(states.iter())
            .map(|(ep, st)| (ep.clone(), st.healthy, st.last_latency))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::advance;

    fn test_config() -> PoolConfig {
        PoolConfig {
            retries: 1,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_is_created_once_and_reused() {
        let manager = ConnectionPoolManager::new(test_config());

        manager.client_for("https://api.example.com").await.unwrap();
        manager.client_for("https://api.example.com").await.unwrap();
        manager.client_for("https://api.example.com").await.unwrap();

        let stats = manager.pool_stats().await;
        assert_eq!(stats.total_pools, 1);
        assert_eq!(stats.connection_reuse_count, 2);
    }

    #[tokio::test]
    async fn concurrent_first_use_builds_one_pool() {
        let manager = Arc::new(ConnectionPoolManager::new(test_config()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.client_for("https://burst.example.com").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(manager.pool_stats().await.total_pools, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pools_are_reaped() {
        let manager = ConnectionPoolManager::new(test_config());
        manager.client_for("https://stale.example.com").await.unwrap();
        assert_eq!(manager.pool_stats().await.total_pools, 1);

        // Past the 10-minute idle threshold.
        advance(Duration::from_secs(601)).await;
        manager.prune_idle().await;

        let stats = manager.pool_stats().await;
        assert_eq!(stats.total_pools, 0);
        assert!(stats.hosts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn active_pools_survive_reaping() {
        let manager = ConnectionPoolManager::new(test_config());
        manager.client_for("https://busy.example.com").await.unwrap();

        advance(Duration::from_secs(400)).await;
        manager
            .record_outcome("https://busy.example.com", true, Some(Duration::from_millis(20)))
            .await;
        advance(Duration::from_secs(400)).await;

        // Last use was 400s ago, below the 600s threshold.
        manager.prune_idle().await;
        assert_eq!(manager.pool_stats().await.total_pools, 1);
    }

    #[tokio::test]
    async fn stats_track_failures_and_latency() {
        let manager = ConnectionPoolManager::new(test_config());
        let host = "https://stats.example.com";
        manager.client_for(host).await.unwrap();

        manager
            .record_outcome(host, true, Some(Duration::from_millis(100)))
            .await;
        manager
            .record_outcome(host, true, Some(Duration::from_millis(300)))
            .await;
        manager.record_outcome(host, false, None).await;

        let stats = manager.pool_stats().await;
        let entry = &stats.hosts[0];
        assert_eq!(entry.requests, 3);
        assert_eq!(entry.failures, 1);
        assert!((entry.average_latency_ms - 200.0).abs() < 1.0);
        assert_eq!(stats.failed_requests, 1);
    }

    #[test]
    fn host_key_strips_path_and_keeps_port() {
        assert_eq!(
            host_key("https://api.example.com/v2/graphql?x=1").unwrap(),
            "https://api.example.com"
        );
        assert_eq!(
            host_key("http://localhost:8080/health").unwrap(),
            "http://localhost:8080"
        );
        assert!(host_key("not a url").is_err());
    }

    #[tokio::test]
    async fn round_robin_skips_unhealthy_endpoints() {
        let lb = LoadBalancedPool::new(
            vec![
                "https://a.example.com".to_string(),
                "https://b.example.com".to_string(),
                "https://c.example.com".to_string(),
            ],
            test_config(),
        );

        lb.states.write().await[1].healthy = false;

        assert_eq!(lb.select().await, 0);
        assert_eq!(lb.select().await, 2); // skipped b
        assert_eq!(lb.select().await, 0);
    }

    #[tokio::test]
    async fn all_unhealthy_falls_back_to_first() {
        let lb = LoadBalancedPool::new(
            vec![
                "https://a.example.com".to_string(),
                "https://b.example.com".to_string(),
            ],
            test_config(),
        );

        {
            let mut states = lb.states.write().await;
            states[0].healthy = false;
            states[1].healthy = false;
        }
        assert_eq!(lb.select().await, 0);
    }
}
