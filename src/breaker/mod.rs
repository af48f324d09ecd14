// src/breaker/mod.rs
//! Circuit breaker protecting the zone control API from cascade failures.
//!
//! One lock per breaker makes failure/success accounting and state
//! transitions atomic with respect to each other. Transitions are published
//! on a broadcast channel; a slow or dropped subscriber can never affect the
//! breaker or other subscribers.

use crate::error::ClientError;
use dashmap::DashMap;
use log::{error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Minimum window samples before rate-based tripping applies.
const MIN_RATE_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// State-change notification, intended for alerting.
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub failure_rate_threshold: f64,
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            failure_rate_threshold: 0.5,
            monitoring_window: Duration::from_secs(60),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32, // meaningful only in HalfOpen
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    opened_at: Option<Instant>,
    history: Vec<(Instant, bool)>, // bounded to the monitoring window
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    state_changes: u64,
}

/// Metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub failure_rate: f64,
    pub state_changes: u64,
    pub recovery_in_secs: Option<u64>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_success: None,
                opened_at: None,
                history: Vec::new(),
                total_requests: 0,
                total_failures: 0,
                total_successes: 0,
                total_rejections: 0,
                state_changes: 0,
            }),
            events,
        }
    }

    /// Subscribe to state transitions. Delivery order matches transition
    /// order; a lagged receiver loses old events, never new state.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Execute `operation` through the breaker.
    ///
    /// While OPEN and before the recovery timeout, rejects immediately with
    /// `ClientError::CircuitOpen` without invoking the operation; the
    /// rejection is counted separately from failures.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        {
            let mut guard = self.state.lock().await;
            if guard.state == CircuitState::Open {
                let elapsed = guard
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    Self::transition(&mut guard, CircuitState::HalfOpen, &self.events);
                    info!("Circuit breaker transitioned to HALF_OPEN, testing recovery");
                } else {
                    guard.total_rejections += 1;
                    let remaining = self.config.recovery_timeout - elapsed;
                    return Err(ClientError::CircuitOpen(format!(
                        "requests blocked for another {}s",
                        remaining.as_secs()
                    )));
                }
            }
            guard.total_requests += 1;
        }

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn on_success(&self) {
        let mut guard = self.state.lock().await;
        guard.total_successes += 1;
        guard.last_success = Some(Instant::now());
        Self::track(&mut guard, self.config.monitoring_window, true);

        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    Self::transition(&mut guard, CircuitState::Closed, &self.events);
                    info!("Circuit breaker CLOSED, normal operation resumed");
                }
            }
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self, cause: &ClientError) {
        let mut guard = self.state.lock().await;
        guard.total_failures += 1;
        guard.failure_count += 1;
        guard.last_failure = Some(Instant::now());
        Self::track(&mut guard, self.config.monitoring_window, false);

        warn!(
            "Circuit breaker failure {}/{}: {}",
            guard.failure_count, self.config.failure_threshold, cause
        );

        match guard.state {
            CircuitState::HalfOpen => {
                // Any failure while probing reopens immediately, discarding
                // partial successes.
                Self::transition(&mut guard, CircuitState::Open, &self.events);
                error!("Circuit breaker reOPENED during recovery probe");
            }
            CircuitState::Closed => {
                if Self::should_open(&guard, &self.config) {
                    Self::transition(&mut guard, CircuitState::Open, &self.events);
                    error!(
                        "Circuit breaker OPENED, recovery attempt in {}s",
                        self.config.recovery_timeout.as_secs()
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn track(guard: &mut BreakerState, window: Duration, success: bool) {
        let now = Instant::now();
        guard.history.push((now, success));
        guard.history.retain(|(t, _)| now.duration_since(*t) <= window);
    }

    fn should_open(guard: &BreakerState, config: &CircuitBreakerConfig) -> bool {
        if guard.failure_count >= config.failure_threshold {
            return true;
        }
        if guard.history.len() >= MIN_RATE_SAMPLES {
            let failures = guard.history.iter().filter(|(_, ok)| !ok).count();
            let rate = failures as f64 / guard.history.len() as f64;
            if rate >= config.failure_rate_threshold {
                info!("Opening circuit on failure rate {:.0}%", rate * 100.0);
                return true;
            }
        }
        false
    }

    fn transition(
        guard: &mut BreakerState,
        to: CircuitState,
        events: &broadcast::Sender<CircuitEvent>,
    ) {
        let from = guard.state;
        guard.state = to;
        guard.state_changes += 1;
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };

        // No subscribers is fine; send only fails when none exist.
        let _ = events.send(CircuitEvent {
            from,
            to,
            at: Instant::now(),
        });
    }

    /// Time until the breaker will allow a recovery probe, if OPEN.
    pub async fn recovery_in(&self) -> Option<Duration> {
        let guard = self.state.lock().await;
        match (guard.state, guard.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(self.config.recovery_timeout.saturating_sub(opened.elapsed()))
            }
            _ => None,
        }
    }

    /// Manually reset to CLOSED, clearing history. A no-op transition on an
    /// already-closed breaker emits no event.
    pub async fn reset(&self) {
        let mut guard = self.state.lock().await;
        if guard.state != CircuitState::Closed {
            Self::transition(&mut guard, CircuitState::Closed, &self.events);
        }
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.history.clear();
        info!("Circuit breaker manually reset to CLOSED");
    }

    /// Manually trip to OPEN.
    pub async fn trip(&self) {
        let mut guard = self.state.lock().await;
        if guard.state != CircuitState::Open {
            Self::transition(&mut guard, CircuitState::Open, &self.events);
        }
        warn!("Circuit breaker manually tripped OPEN");
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let guard = self.state.lock().await;
        let failure_rate = if guard.history.is_empty() {
            0.0
        } else {
            guard.history.iter().filter(|(_, ok)| !ok).count() as f64
                / guard.history.len() as f64
        };

        CircuitBreakerMetrics {
            state: guard.state.as_str(),
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            total_requests: guard.total_requests,
            total_failures: guard.total_failures,
            total_successes: guard.total_successes,
            total_rejections: guard.total_rejections,
            failure_rate,
            state_changes: guard.state_changes,
            recovery_in_secs: match (guard.state, guard.opened_at) {
                (CircuitState::Open, Some(opened)) => Some(
                    self.config
                        .recovery_timeout
                        .saturating_sub(opened.elapsed())
                        .as_secs(),
                ),
                _ => None,
            },
        }
    }
}

/// One breaker per logical endpoint name, lazily created from a shared
/// default configuration, so one misbehaving endpoint cannot starve traffic
/// to a healthy one.
pub struct MultiCircuitBreaker {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl MultiCircuitBreaker {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Created circuit breaker for endpoint: {}", name);
                Arc::new(CircuitBreaker::new(self.default_config.clone()))
            });
        entry.clone()
    }

    pub async fn call<F, Fut, T>(&self, name: &str, operation: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        self.breaker(name).call(operation).await
    }

    pub async fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset().await;
            info!("Reset circuit breaker: {}", entry.key());
        }
    }

    pub async fn all_metrics(&self) -> Vec<(String, CircuitBreakerMetrics)> {
        let mut out = Vec::new();
        for entry in self.breakers.iter() {
            out.push((entry.key().clone(), entry.value().metrics().await));
        }
        out
    }
}
