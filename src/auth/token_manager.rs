//! Credential/Token Manager
//! Mission: One valid bearer token at all times, never two exchanges in flight
//!
//! The cached fast path is synchronous and lock-cheap; the refresh path is
//! single-flight: every caller that arrives while an exchange is running
//! awaits that exchange's result instead of issuing its own.

use crate::errors::{PitwallError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A token expiring within this margin is treated as already expired.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(30);
/// Background refresh cadence and lookahead.
const PROACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const PROACTIVE_REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// Identity provider response to a client-credentials exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}

/// The exchange call, abstracted so tests can inject a counting fake.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, client_id: &str, client_secret: &str) -> Result<TokenResponse>;
}

/// Production exchange: POST client credentials as a form body.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    token_url: String,
}

impl HttpTokenExchange {
    pub fn new(token_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url,
        }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, client_id: &str, client_secret: &str) -> Result<TokenResponse> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| PitwallError::Auth(format!("token exchange failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PitwallError::Auth(format!(
                "token exchange rejected ({}): {}",
                status, body
            )));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| PitwallError::Auth(format!("malformed token response: {}", e)))
    }
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn valid(&self) -> bool {
        Instant::now() + EXPIRY_SAFETY_MARGIN < self.expires_at
    }
}

struct Credentials {
    client_id: String,
    client_secret: String,
}

/// Owns the credential session. Cheap to clone via `Arc`.
pub struct TokenManager {
    exchange: Arc<dyn TokenExchange>,
    credentials: RwLock<Option<Credentials>>,
    cached: RwLock<Option<CachedToken>>,
    /// Serializes refreshes; callers that lose the race re-check the cache
    /// after acquiring and find the winner's token.
    refresh_lock: tokio::sync::Mutex<()>,
    token_tx: watch::Sender<Option<String>>,
}

impl TokenManager {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Arc<Self> {
        let (token_tx, _) = watch::channel(None);
        Arc::new(Self {
            exchange,
            credentials: RwLock::new(None),
            cached: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            token_tx,
        })
    }

    /// Set (or replace) the client identity. Clears any cached token so a
    /// stale credential is never reused under the new identity.
    pub fn configure(&self, client_id: String, client_secret: String) {
        *self.credentials.write() = Some(Credentials {
            client_id,
            client_secret,
        });
        *self.cached.write() = None;
        debug!("token manager reconfigured; cache cleared");
    }

    /// Drop the session entirely.
    pub fn logout(&self) {
        *self.credentials.write() = None;
        *self.cached.write() = None;
        let _ = self.token_tx.send(None);
        info!("credential session cleared");
    }

    /// Observe token replacements (e.g. to re-authenticate a live channel).
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token_tx.subscribe()
    }

    /// Return a token valid beyond the safety margin.
    ///
    /// Cached fast path performs no network call and takes no async lock.
    pub async fn get_token(&self) -> Result<String> {
        if let Some(cached) = self.cached.read().as_ref() {
            if cached.valid() {
                return Ok(cached.token.clone());
            }
        }

        // Slow path: serialize on the refresh lock. Whoever wins performs
        // the exchange; everyone else re-checks the cache and leaves.
        let _guard = self.refresh_lock.lock().await;
        if let Some(cached) = self.cached.read().as_ref() {
            if cached.valid() {
                return Ok(cached.token.clone());
            }
        }
        self.refresh().await
    }

    /// Spawn the proactive refresh loop. Failures are logged and retried on
    /// the next tick, never fatal.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROACTIVE_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !manager.expiring_within(PROACTIVE_REFRESH_WINDOW) {
                    continue;
                }
                let _guard = manager.refresh_lock.lock().await;
                if !manager.expiring_within(PROACTIVE_REFRESH_WINDOW) {
                    continue;
                }
                match manager.refresh().await {
                    Ok(_) => debug!("proactive token refresh succeeded"),
                    Err(e) => warn!("proactive token refresh failed, will retry: {}", e),
                }
            }
        })
    }

    fn expiring_within(&self, window: Duration) -> bool {
        match self.cached.read().as_ref() {
            // No token yet: nothing to proactively refresh until a caller
            // actually needs one.
            None => false,
            Some(cached) => Instant::now() + window >= cached.expires_at,
        }
    }

    /// Perform the exchange and replace the cached session wholesale.
    /// Callers must hold `refresh_lock`.
    async fn refresh(&self) -> Result<String> {
        let (client_id, client_secret) = {
            let creds = self.credentials.read();
            match creds.as_ref() {
                Some(c) => (c.client_id.clone(), c.client_secret.clone()),
                None => return Err(PitwallError::Auth("no credentials configured".into())),
            }
        };

        let response = self.exchange.exchange(&client_id, &client_secret).await?;
        let expires_at = Instant::now() + Duration::from_secs(response.expires_in);
        *self.cached.write() = Some(CachedToken {
            token: response.access_token.clone(),
            expires_at,
        });
        let _ = self.token_tx.send(Some(response.access_token.clone()));
        info!("bearer token refreshed (expires in {}s)", response.expires_in);
        Ok(response.access_token)
    }
}
