//! Short-lived credential cache with single-flight refresh.
//!
//! APNs provider JWTs and FCM OAuth2 access tokens both expire; this cache
//! hands out the current value until it nears expiry, then lets exactly one
//! caller perform the refresh while concurrent callers queue behind it.
//! Expiries use `tokio::time::Instant` so tests can drive the clock.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::Result;

/// Cached credential value.
#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Single-flight cache for one pushkin's credential.
#[derive(Debug)]
pub struct TokenCache {
    cached: RwLock<Option<CachedToken>>,
    refresh_gate: Mutex<()>,
    refresh_margin: Duration,
}

impl TokenCache {
    /// Create an empty cache.
    ///
    /// `refresh_margin` is subtracted from each token's lifetime, so a
    /// refresh happens before the provider actually rejects the credential.
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            cached: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refresh_margin,
        }
    }

    /// Get a valid credential, refreshing through `refresh` if necessary.
    ///
    /// `refresh` returns the new value and its lifetime. At most one refresh
    /// runs at a time; callers queuing behind an in-progress refresh re-check
    /// the cache once it completes and only refresh themselves if it failed.
    /// A cancelled refresh releases the gate, so the next caller retries.
    pub async fn get<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration)>>,
    {
        if let Some(value) = self.peek().await {
            return Ok(value);
        }

        // One refresher at a time; waiters queue here in FIFO order.
        let _gate = self.refresh_gate.lock().await;

        // A refresh that completed while we waited serves this call.
        if let Some(value) = self.peek().await {
            return Ok(value);
        }

        let (value, lifetime) = refresh().await?;
        let expires_at = Instant::now() + lifetime.saturating_sub(self.refresh_margin);

        let mut cached = self.cached.write().await;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });

        Ok(value)
    }

    /// Drop the cached value so the next `get` refreshes.
    ///
    /// Used when the provider rejects a credential before its expected expiry.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }

    /// Install a value directly, bypassing refresh. Test seam.
    #[cfg(test)]
    pub(crate) async fn prime(&self, value: &str, lifetime: Duration) {
        let mut cached = self.cached.write().await;
        *cached = Some(CachedToken {
            value: value.to_string(),
            expires_at: Instant::now() + lifetime,
        });
    }

    /// Return the cached value if it is still valid.
    async fn peek(&self) -> Option<String> {
        let cached = self.cached.read().await;
        match &*cached {
            Some(token) if token.expires_at > Instant::now() => Some(token.value.clone()),
            _ => None,
        }
    }
}
