// src/auth/mod.rs
//! OAuth2 session management for the zone control API.
//!
//! One `TokenManager` owns one session. Refreshes are lazy (triggered by the
//! first caller that observes the token near expiry) and exclusive: the
//! refresh lock plus a double-check guarantee a single grant request no
//! matter how many callers race on an expired token.

use crate::error::ClientError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

/// A token is treated as expired this long before its actual expiry, so
/// refresh is always proactive and a handed-out token never goes stale
/// mid-request.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// OAuth2 access token value object. Replaced wholesale on every refresh,
/// never mutated in place.
#[derive(Debug, Clone)]
pub struct AccessToken {
    token: String,
    token_type: String,
    expires_at: Instant,
    refresh_token: Option<String>,
}

impl AccessToken {
    /// Valid means at least [`EXPIRY_BUFFER`] of lifetime left.
    pub fn is_valid(&self) -> bool {
        self.remaining() >= EXPIRY_BUFFER
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// `Authorization` header value, e.g. `Bearer eyJ...`.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

fn default_expires_in() -> u64 {
    3600
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Body of a successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

/// Transport seam for the token endpoint, so refresh semantics are testable
/// without a network.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn client_credentials_grant(&self) -> Result<TokenResponse, ClientError>;
    async fn refresh_token_grant(&self, refresh_token: &str) -> Result<TokenResponse, ClientError>;
    async fn revoke(&self, token: &str) -> Result<(), ClientError>;
}

/// Production transport: form-encoded POSTs against the OAuth2 endpoint.
pub struct HttpTokenTransport {
    http: reqwest::Client,
    token_url: String,
    revoke_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

impl HttpTokenTransport {
    pub fn new(token_url: &str, client_id: &str, client_secret: &str, scope: &str) -> Self {
        let revoke_url = if let Some(base) = token_url.strip_suffix("/token") {
            format!("{}/revoke", base)
        } else {
            format!("{}/revoke", token_url.trim_end_matches('/'))
        };

        Self {
            http: reqwest::Client::new(),
            token_url: token_url.to_string(),
            revoke_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scope.to_string(),
        }
    }

    async fn post_grant(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ClientError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(form)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        Ok(response.json::<TokenResponse>().await?)
    }
}

#[async_trait]
impl TokenTransport for HttpTokenTransport {
    async fn client_credentials_grant(&self) -> Result<TokenResponse, ClientError> {
        self.post_grant(&[
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("scope", &self.scope),
        ])
        .await
    }

    async fn refresh_token_grant(&self, refresh_token: &str) -> Result<TokenResponse, ClientError> {
        self.post_grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(&self.revoke_url)
            .form(&[
                ("token", token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "revoke endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Snapshot of authentication metrics.
#[derive(Debug, Clone, Serialize)]
pub struct AuthMetrics {
    pub is_authenticated: bool,
    pub token_remaining_secs: u64,
    pub refresh_count: u64,
    pub failed_refresh_count: u64,
    pub last_refresh_time: Option<DateTime<Utc>>,
}

/// Owns the OAuth2 session for one client instance.
pub struct TokenManager {
    transport: Arc<dyn TokenTransport>,
    current: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    refresh_count: AtomicU64,
    failed_refresh_count: AtomicU64,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl TokenManager {
    pub fn new(transport: Arc<dyn TokenTransport>) -> Self {
        Self {
            transport,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
            failed_refresh_count: AtomicU64::new(0),
            last_refresh: RwLock::new(None),
        }
    }

    /// Returns a token with at least 60s of lifetime, refreshing if needed.
    ///
    /// Fast path is a shared read. The slow path serializes behind the
    /// refresh lock and re-checks validity after acquisition, so concurrent
    /// callers on an expired token produce exactly one grant request.
    pub async fn get_valid_token(&self) -> Result<AccessToken, ClientError> {
        if let Some(token) = &*self.current.read().await {
            if token.is_valid() {
                return Ok(token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Double-check: another caller may have refreshed while we waited.
        if let Some(token) = &*self.current.read().await {
            if token.is_valid() {
                debug!("Token already refreshed by a concurrent caller");
                return Ok(token.clone());
            }
        }

        self.refresh_with_retries().await?;

        let guard = self.current.read().await;
        guard
            .clone()
            .ok_or_else(|| ClientError::Auth("no token after refresh".to_string()))
    }

    /// `Authorization` header value for the current session, ensuring the
    /// token is valid first.
    pub async fn authorization_header(&self) -> Result<String, ClientError> {
        Ok(self.get_valid_token().await?.header_value())
    }

    /// Drops the stored token so the next call performs a fresh grant.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
        debug!("Token invalidated; next caller will refresh");
    }

    /// Revokes the current token at the authorization server and clears
    /// local state on success.
    pub async fn revoke(&self) -> Result<(), ClientError> {
        let token = self.current.read().await.clone();
        if let Some(token) = token {
            self.transport.revoke(token.secret()).await?;
            *self.current.write().await = None;
            info!("Token revoked");
        }
        Ok(())
    }

    pub async fn metrics(&self) -> AuthMetrics {
        let current = self.current.read().await;
        let (is_authenticated, remaining) = match &*current {
            Some(token) => (token.is_valid(), token.remaining().as_secs()),
            None => (false, 0),
        };

        AuthMetrics {
            is_authenticated,
            token_remaining_secs: remaining,
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
            failed_refresh_count: self.failed_refresh_count.load(Ordering::Relaxed),
            last_refresh_time: *self.last_refresh.read().await,
        }
    }

    /// Up to three attempts with 1s/2s/4s backoff. On exhaustion the
    /// previous (possibly expired) token is left in place so callers can
    /// decide to retry later.
    async fn refresh_with_retries(&self) -> Result<(), ClientError> {
        let mut last_error = None;

        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            match self.refresh_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.failed_refresh_count.fetch_add(1, Ordering::Relaxed);
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(
                        "Token refresh attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        MAX_REFRESH_ATTEMPTS,
                        e,
                        delay
                    );
                    last_error = Some(e);
                    if attempt + 1 < MAX_REFRESH_ATTEMPTS {
                        sleep(delay).await;
                    }
                }
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        error!(
            "Token refresh failed after {} attempts: {}",
            MAX_REFRESH_ATTEMPTS, cause
        );
        Err(ClientError::Auth(format!(
            "failed to refresh token after {} attempts: {}",
            MAX_REFRESH_ATTEMPTS, cause
        )))
    }

    async fn refresh_once(&self) -> Result<(), ClientError> {
        let prior_refresh = self
            .current
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        // Refresh-token grant when we hold one; client-credentials is the
        // fallback, including when the server rejects the refresh token.
        let (response, kept_refresh) = match &prior_refresh {
            Some(refresh_token) => {
                match self.transport.refresh_token_grant(refresh_token).await {
                    Ok(r) => (r, prior_refresh.clone()),
                    Err(e) => {
                        warn!(
                            "Refresh token rejected, falling back to client credentials: {}",
                            e
                        );
                        (self.transport.client_credentials_grant().await?, None)
                    }
                }
            }
            None => (self.transport.client_credentials_grant().await?, None),
        };

        let expires_in = response.expires_in;
        let token = AccessToken {
            token: response.access_token,
            token_type: response.token_type,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
            refresh_token: response.refresh_token.or(kept_refresh),
        };

        *self.current.write().await = Some(token);
        let total = self.refresh_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_refresh.write().await = Some(Utc::now());

        info!(
            "Token refreshed, expires in {}s (total refreshes: {})",
            expires_in, total
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    struct MockTransport {
        grants: AtomicU64,
        refresh_grants: AtomicU64,
        fail: AtomicBool,
        reject_refresh: AtomicBool,
        expires_in: u64,
        issue_refresh_token: bool,
    }

    impl MockTransport {
        fn new(expires_in: u64) -> Self {
            Self {
                grants: AtomicU64::new(0),
                refresh_grants: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                reject_refresh: AtomicBool::new(false),
                expires_in,
                issue_refresh_token: false,
            }
        }

        fn response(&self) -> TokenResponse {
            TokenResponse {
                access_token: format!("tok-{}", self.grants.load(Ordering::SeqCst)),
                refresh_token: if self.issue_refresh_token {
                    Some("refresh-1".to_string())
                } else {
                    None
                },
                expires_in: self.expires_in,
                token_type: "Bearer".to_string(),
            }
        }
    }

    #[async_trait]
    impl TokenTransport for MockTransport {
        async fn client_credentials_grant(&self) -> Result<TokenResponse, ClientError> {
            // Widen the race window so contention tests are meaningful.
            sleep(Duration::from_millis(10)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("token endpoint down".to_string()));
            }
            self.grants.fetch_add(1, Ordering::SeqCst);
            Ok(self.response())
        }

        async fn refresh_token_grant(&self, _: &str) -> Result<TokenResponse, ClientError> {
            if self.reject_refresh.load(Ordering::SeqCst) {
                return Err(ClientError::Auth("invalid_grant".to_string()));
            }
            self.refresh_grants.fetch_add(1, Ordering::SeqCst);
            Ok(self.response())
        }

        async fn revoke(&self, _: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_trigger_exactly_one_refresh() {
        let transport = Arc::new(MockTransport::new(3600));
        let manager = Arc::new(TokenManager::new(transport.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.get_valid_token().await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(transport.grants.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_token_skips_the_transport() {
        let transport = Arc::new(MockTransport::new(3600));
        let manager = TokenManager::new(transport.clone());

        manager.get_valid_token().await.unwrap();
        manager.get_valid_token().await.unwrap();

        assert_eq!(transport.grants.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_lived_token_is_replaced_not_mutated() {
        // expires_in below the 60s buffer means the token is never "valid".
        let transport = Arc::new(MockTransport::new(30));
        let manager = TokenManager::new(transport.clone());

        let first = manager.get_valid_token().await.unwrap();
        let second = manager.get_valid_token().await.unwrap();

        assert_eq!(transport.grants.load(Ordering::SeqCst), 2);
        assert!(first.secret() != second.secret());
    }

    #[tokio::test]
    async fn rejected_refresh_token_falls_back_to_client_credentials() {
        let mut mock = MockTransport::new(30);
        mock.issue_refresh_token = true;
        let transport = Arc::new(mock);
        let manager = TokenManager::new(transport.clone());

        // First grant issues a refresh token.
        manager.get_valid_token().await.unwrap();
        assert_eq!(transport.grants.load(Ordering::SeqCst), 1);

        // Second refresh tries the refresh grant, gets rejected, falls back.
        transport.reject_refresh.store(true, Ordering::SeqCst);
        manager.get_valid_token().await.unwrap();

        assert_eq!(transport.refresh_grants.load(Ordering::SeqCst), 0);
        assert_eq!(transport.grants.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_auth_error_and_keep_old_token() {
        let transport = Arc::new(MockTransport::new(30));
        let manager = TokenManager::new(transport.clone());

        manager.get_valid_token().await.unwrap();
        transport.fail.store(true, Ordering::SeqCst);

        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));

        let metrics = manager.metrics().await;
        assert_eq!(metrics.refresh_count, 1);
        assert_eq!(metrics.failed_refresh_count, 3);
        // The stale token is still in place for callers that retry later.
        assert!(manager.current.read().await.is_some());
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_grant() {
        let transport = Arc::new(MockTransport::new(3600));
        let manager = TokenManager::new(transport.clone());

        manager.get_valid_token().await.unwrap();
        manager.invalidate().await;
        manager.get_valid_token().await.unwrap();

        assert_eq!(transport.grants.load(Ordering::SeqCst), 2);
    }
}
