// src/limiter/mod.rs
//! Outbound rate limiting for the zone control API.
//!
//! Two gates are combined on every admission: a sliding 60-second window
//! enforcing the per-minute budget, and a token bucket smoothing per-second
//! bursts. An adaptive multiplier in [0.5, 1.2] shrinks or grows both
//! effective limits based on observed latency and error rate. `acquire`
//! never fails for being over budget; it waits instead.

use crate::error::ClientError;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const RESPONSE_SAMPLES: usize = 100;
const MIN_ADAPTIVE_SAMPLES: usize = 10;
const MULTIPLIER_FLOOR: f64 = 0.5;
const MULTIPLIER_CEILING: f64 = 1.2;

/// Rate limiter configuration. Defaults match the remote API's published
/// 1000 requests/minute budget.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub enable_adaptive: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            requests_per_second: 20,
            burst_size: 50,
            enable_adaptive: true,
        }
    }
}

/// Sliding window state: pruned before every admission check.
struct WindowState {
    entries: VecDeque<Instant>,
}

/// Token bucket state: fractional tokens, never above capacity.
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Adaptive controller state fed by `report_response`.
struct AdaptiveState {
    response_times: VecDeque<f64>,
    error_count: u64,
    success_count: u64,
    multiplier: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    blocked_requests: u64,
    total_wait: Duration,
}

/// Usage snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterUsage {
    pub requests_per_minute_limit: u32,
    pub requests_in_last_minute: usize,
    pub usage_percentage: f64,
    pub available_tokens: f64,
    pub max_tokens: u32,
    pub adaptive_multiplier: f64,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub average_wait_secs: f64,
    pub error_count: u64,
    pub success_count: u64,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    window: Mutex<WindowState>,
    bucket: Mutex<BucketState>,
    adaptive: Mutex<AdaptiveState>,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let burst = config.burst_size as f64;
        Self {
            config,
            window: Mutex::new(WindowState {
                entries: VecDeque::new(),
            }),
            bucket: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            adaptive: Mutex::new(AdaptiveState {
                response_times: VecDeque::with_capacity(RESPONSE_SAMPLES),
                error_count: 0,
                success_count: 0,
                multiplier: 1.0,
            }),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Acquire permission to make one request, waiting cooperatively as long
    /// as needed. Returns the total time spent waiting.
    ///
    /// `priority` is 1..=10, 5 neutral. Higher priority pays a smaller token
    /// cost and has its wait scaled down (never up) — an intentional
    /// priority-inversion-avoidance trade-off.
    pub async fn acquire(&self, priority: u8) -> Duration {
        let start = Instant::now();
        let multiplier = self.multiplier().await;

        let mut wait = {
            let mut window = self.window.lock().await;
            self.check_minute_window(&mut window, multiplier)
        };

        {
            let mut bucket = self.bucket.lock().await;
            let token_wait = self.check_token_bucket(&mut bucket, priority, multiplier);
            if token_wait > wait {
                wait = token_wait;
            }
        }

        if !wait.is_zero() {
            let scale = (1.0 - (priority as f64 - 5.0) * 0.1).clamp(0.0, 1.0);
            let adjusted = wait.mul_f64(scale);
            debug!(
                "Rate limit: waiting {:.2}s (priority {})",
                adjusted.as_secs_f64(),
                priority
            );
            sleep(adjusted).await;

            let mut counters = self.counters.lock().await;
            counters.blocked_requests += 1;
            counters.total_wait += adjusted;
        }

        self.counters.lock().await.total_requests += 1;
        start.elapsed()
    }

    /// Prunes entries older than the window, then either admits (recording
    /// the timestamp) or returns the wait until the oldest entry expires.
    fn check_minute_window(&self, window: &mut WindowState, multiplier: f64) -> Duration {
        let now = Instant::now();
        while let Some(front) = window.entries.front() {
            if now.duration_since(*front) >= WINDOW {
                window.entries.pop_front();
            } else {
                break;
            }
        }

        let effective_limit = (self.config.requests_per_minute as f64 * multiplier) as usize;
        if window.entries.len() >= effective_limit.max(1) {
            if let Some(oldest) = window.entries.front() {
                return WINDOW.saturating_sub(now.duration_since(*oldest));
            }
        }

        window.entries.push_back(now);
        Duration::ZERO
    }

    /// Refills proportionally to elapsed time, then charges the
    /// priority-scaled cost or returns the wait for enough tokens.
    fn check_token_bucket(
        &self,
        bucket: &mut BucketState,
        priority: u8,
        multiplier: f64,
    ) -> Duration {
        let now = Instant::now();
        let refill_rate = self.config.requests_per_second as f64 * multiplier;
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(self.config.burst_size as f64);
        bucket.last_refill = now;

        let cost = (1.0 - (priority as f64 - 5.0) * 0.05).clamp(0.5, 1.5);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Duration::ZERO;
        }

        let needed = cost - bucket.tokens;
        Duration::from_secs_f64(needed / refill_rate)
    }

    /// Feed the adaptive controller with an observed response.
    pub async fn report_response(&self, latency: Duration, success: bool) {
        if !self.config.enable_adaptive {
            return;
        }

        let mut adaptive = self.adaptive.lock().await;
        if adaptive.response_times.len() == RESPONSE_SAMPLES {
            adaptive.response_times.pop_front();
        }
        adaptive.response_times.push_back(latency.as_secs_f64());

        if success {
            adaptive.success_count += 1;
            adaptive.error_count = adaptive.error_count.saturating_sub(1); // decay
        } else {
            adaptive.error_count += 1;
        }

        if adaptive.response_times.len() < MIN_ADAPTIVE_SAMPLES {
            return;
        }

        let avg: f64 =
            adaptive.response_times.iter().sum::<f64>() / adaptive.response_times.len() as f64;
        let error_rate = adaptive.error_count as f64
            / (adaptive.error_count + adaptive.success_count).max(1) as f64;

        if avg > 2.0 || error_rate > 0.1 {
            let next = (adaptive.multiplier - 0.1).max(MULTIPLIER_FLOOR);
            if next < adaptive.multiplier {
                adaptive.multiplier = next;
                info!("Reducing rate limit multiplier to {:.2}", next);
            }
        } else if avg < 0.5 && error_rate < 0.01 {
            let next = (adaptive.multiplier + 0.05).min(MULTIPLIER_CEILING);
            if next > adaptive.multiplier {
                adaptive.multiplier = next;
                info!("Increasing rate limit multiplier to {:.2}", next);
            }
        }
    }

    pub async fn multiplier(&self) -> f64 {
        self.adaptive.lock().await.multiplier
    }

    /// Accounts for a wait that was served outside `acquire`, such as the
    /// shared-counter path of the distributed limiter.
    pub(crate) async fn record_external_wait(&self, wait: Duration) {
        let mut counters = self.counters.lock().await;
        counters.total_requests += 1;
        if !wait.is_zero() {
            counters.blocked_requests += 1;
            counters.total_wait += wait;
        }
    }

    /// Pre-emptive wait before a bulk operation that would blow through the
    /// per-minute budget in one go.
    pub async fn wait_if_needed(&self, estimated_requests: usize) -> Duration {
        let multiplier = self.multiplier().await;
        let wait = {
            let mut window = self.window.lock().await;
            let now = Instant::now();
            while let Some(front) = window.entries.front() {
                if now.duration_since(*front) >= WINDOW {
                    window.entries.pop_front();
                } else {
                    break;
                }
            }

            let effective_limit = (self.config.requests_per_minute as f64 * multiplier) as usize;
            let current = window.entries.len();
            if current + estimated_requests > effective_limit {
                let excess = (current + estimated_requests - effective_limit) as f64;
                let per_second = self.config.requests_per_minute as f64 / 60.0;
                Duration::from_secs_f64(excess / per_second)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            info!(
                "Pre-emptive rate limit wait: {:.2}s for {} requests",
                wait.as_secs_f64(),
                estimated_requests
            );
            sleep(wait).await;
        }
        wait
    }

    pub async fn usage(&self) -> RateLimiterUsage {
        let window_len = {
            let mut window = self.window.lock().await;
            let now = Instant::now();
            while let Some(front) = window.entries.front() {
                if now.duration_since(*front) >= WINDOW {
                    window.entries.pop_front();
                } else {
                    break;
                }
            }
            window.entries.len()
        };
        let tokens = self.bucket.lock().await.tokens;
        let adaptive = self.adaptive.lock().await;
        let counters = self.counters.lock().await;

        RateLimiterUsage {
            requests_per_minute_limit: self.config.requests_per_minute,
            requests_in_last_minute: window_len,
            usage_percentage: window_len as f64 / self.config.requests_per_minute as f64 * 100.0,
            available_tokens: tokens,
            max_tokens: self.config.burst_size,
            adaptive_multiplier: adaptive.multiplier,
            total_requests: counters.total_requests,
            blocked_requests: counters.blocked_requests,
            average_wait_secs: counters.total_wait.as_secs_f64()
                / counters.blocked_requests.max(1) as f64,
            error_count: adaptive.error_count,
            success_count: adaptive.success_count,
        }
    }

    /// Resets all limiter state, including the adaptive multiplier.
    pub async fn reset(&self) {
        self.window.lock().await.entries.clear();
        {
            let mut bucket = self.bucket.lock().await;
            bucket.tokens = self.config.burst_size as f64;
            bucket.last_refill = Instant::now();
        }
        {
            let mut adaptive = self.adaptive.lock().await;
            adaptive.response_times.clear();
            adaptive.error_count = 0;
            adaptive.success_count = 0;
            adaptive.multiplier = 1.0;
        }
        *self.counters.lock().await = Counters::default();
        info!("Rate limiter reset");
    }
}

/// Multi-process variant: the per-minute budget is counted in the shared
/// store (keyed by current minute), so all processes draw from one budget.
/// The burst bucket and adaptive controller stay process-local. Loss of the
/// shared store degrades to local limiting, never a hard failure.
pub struct DistributedRateLimiter {
    local: RateLimiter,
    redis: Mutex<ConnectionManager>,
    key_prefix: String,
}

impl DistributedRateLimiter {
    pub fn new(local: RateLimiter, redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            local,
            redis: Mutex::new(redis),
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn local(&self) -> &RateLimiter {
        &self.local
    }

    pub async fn acquire(&self, priority: u8) -> Duration {
        match self.shared_window_wait(priority).await {
            Ok(wait) => {
                if !wait.is_zero() {
                    debug!("Distributed rate limit: waiting {:.2}s", wait.as_secs_f64());
                    sleep(wait).await;
                }
                // Burst smoothing stays local.
                let bucket_wait = {
                    let multiplier = self.local.multiplier().await;
                    let mut bucket = self.local.bucket.lock().await;
                    self.local
                        .check_token_bucket(&mut bucket, priority, multiplier)
                };
                if !bucket_wait.is_zero() {
                    sleep(bucket_wait).await;
                }
                self.local.record_external_wait(wait + bucket_wait).await;
                wait + bucket_wait
            }
            Err(e) => {
                warn!(
                    "Shared rate-limit counter unavailable, degrading to local window: {}",
                    e
                );
                self.local.acquire(priority).await
            }
        }
    }

    pub async fn report_response(&self, latency: Duration, success: bool) {
        self.local.report_response(latency, success).await;
    }

    async fn shared_window_wait(&self, priority: u8) -> Result<Duration, ClientError> {
        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / 60;
        let key = format!("{}:minute:{}", self.key_prefix, minute);

        let mut conn = self.redis.lock().await.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, 70)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let multiplier = self.local.multiplier().await;
        let effective_limit =
            (self.local.config.requests_per_minute as f64 * multiplier) as u64;

        if count > effective_limit {
            let per_second = self.local.config.requests_per_minute as f64 / 60.0;
            let base = (count - effective_limit) as f64 / per_second;
            let scale = (1.0 - (priority as f64 - 5.0) * 0.1).clamp(0.0, 1.0);
            Ok(Duration::from_secs_f64(base * scale))
        } else {
            Ok(Duration::ZERO)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use pretty_assertions::assert_eq;

    fn small_config(per_minute: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: per_minute,
            requests_per_second: 1000, // keep the bucket out of the way
            burst_size: 10_000,
            enable_adaptive: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_admits_at_most_n_per_rolling_minute() {
        let n = 5u32;
        let limiter = RateLimiter::new(small_config(n));

        let start = Instant::now();
        // 2N acquisitions back to back: the second N must each wait for a
        // window slot, so any N+1 consecutive admissions span >= 60s.
        for _ in 0..(2 * n) {
            limiter.acquire(5).await;
        }
        let span = start.elapsed();
        assert!(
            span >= WINDOW,
            "2N admissions finished in {:?}, window not enforced",
            span
        );

        let usage = limiter.usage().await;
        assert!(usage.requests_in_last_minute <= n as usize);
        assert_eq!(usage.total_requests, (2 * n) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn under_budget_acquire_does_not_wait() {
        let limiter = RateLimiter::new(small_config(100));
        let waited = limiter.acquire(5).await;
        assert!(waited < Duration::from_millis(5));
    }

    #[tokio::test]
    async fn token_cost_is_cheaper_for_high_priority() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            requests_per_minute: 10_000,
            requests_per_second: 10,
            burst_size: 100,
            enable_adaptive: false,
        });

        {
            let mut bucket = limiter.bucket.lock().await;
            bucket.tokens = 100.0;
            let before = bucket.tokens;
            limiter.check_token_bucket(&mut bucket, 10, 1.0);
            let high_cost = before - bucket.tokens;
            assert_approx_eq!(high_cost, 0.75, 1e-9);

            bucket.tokens = 100.0;
            limiter.check_token_bucket(&mut bucket, 1, 1.0);
            let low_cost = 100.0 - bucket.tokens;
            assert_approx_eq!(low_cost, 1.2, 1e-9);
        }
    }

    #[tokio::test]
    async fn adaptive_multiplier_shrinks_on_errors_and_stays_bounded() {
        let limiter = RateLimiter::new(small_config(100));

        for _ in 0..50 {
            limiter
                .report_response(Duration::from_secs(3), false)
                .await;
        }
        let m = limiter.multiplier().await;
        assert_approx_eq!(m, MULTIPLIER_FLOOR, 1e-9);

        limiter.reset().await;
        for _ in 0..200 {
            limiter
                .report_response(Duration::from_millis(100), true)
                .await;
        }
        let m = limiter.multiplier().await;
        assert!(m <= MULTIPLIER_CEILING + 1e-9);
        assert!(m > 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_wait_is_scaled_down() {
        let n = 2u32;
        let limiter = RateLimiter::new(small_config(n));
        limiter.acquire(5).await;
        limiter.acquire(5).await;

        // Third call must wait; priority 10 scales the wait by 0.5.
        let start = Instant::now();
        limiter.acquire(10).await;
        let waited = start.elapsed();
        assert!(waited <= WINDOW.mul_f64(0.5) + Duration::from_millis(50));
        assert!(waited >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn externally_served_waits_count_as_blocked() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_external_wait(Duration::ZERO).await;
        limiter.record_external_wait(Duration::from_millis(500)).await;

        let usage = limiter.usage().await;
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.blocked_requests, 1);
        assert!(usage.average_wait_secs >= 0.5 - 1e-9);
    }
}
