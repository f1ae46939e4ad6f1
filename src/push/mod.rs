//! Pushkins: provider-bound dispatch workers, and their shared plumbing.
//!
//! Each configured app maps to one pushkin. A pushkin owns its HTTP client,
//! credential cache and concurrency limiter, and turns heterogeneous provider
//! responses into the uniform per-device outcome consumed by the dispatcher.

pub mod apns;
pub mod auth;
pub mod dispatcher;
pub mod fcm;
pub mod http;
pub mod limiter;
pub mod notification;
pub mod webpush;

pub use apns::ApnsPushkin;
pub use dispatcher::{NotificationDispatcher, PushkinRegistry};
pub use fcm::FcmPushkin;
pub use notification::{Device, Notification, NotifyRequest};
pub use webpush::WebPushPushkin;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::RateLimitConfig;
use crate::metrics::Metrics;
use limiter::RateBucket;

/// Successful per-device outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The provider acknowledged the push; nothing to do.
    Accepted,
    /// The registration is dead; the caller must forget this pushkey.
    Rejected(String),
}

/// Per-device failure. All variants are reported to the caller as a
/// transient gateway error so the whole batch is retried.
#[derive(Debug, Clone, Error)]
pub enum DispatchFailure {
    /// Provider is unavailable: 5xx, 429, network or TLS failure.
    #[error("provider unavailable: {0}")]
    Provider(String),

    /// A refreshable credential expired and could not be renewed.
    #[error("credential refresh failed: {0}")]
    Auth(String),

    /// The provider says this gateway is misconfigured. Logged at ERROR by
    /// the pushkin that produced it so an operator notices.
    #[error("gateway misconfigured for this app: {0}")]
    BadConfig(String),

    /// The overall dispatch deadline elapsed.
    #[error("dispatch timed out")]
    Timeout,
}

impl DispatchFailure {
    /// Label used on the per-outcome dispatch counter.
    #[must_use]
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Provider(_) => "transient",
            Self::Auth(_) => "auth",
            Self::BadConfig(_) => "bad_config",
            Self::Timeout => "timeout",
        }
    }
}

/// Result of dispatching one notification to one device.
pub type DispatchResult = std::result::Result<DispatchOutcome, DispatchFailure>;

/// Concurrency and rate plumbing shared by all pushkin variants.
///
/// `begin_dispatch` must be called before any outbound request; the returned
/// permit is held for the duration of the request and released on every exit
/// path, including cancellation.
#[derive(Debug)]
pub(crate) struct PushkinCore {
    name: String,
    semaphore: Arc<Semaphore>,
    rate: Option<RateBucket>,
    metrics: Arc<Metrics>,
}

impl PushkinCore {
    pub(crate) fn new(
        name: String,
        max_connections: usize,
        rate_limit: Option<RateLimitConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
            rate: rate_limit.map(RateBucket::new),
            metrics,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Pass the rate gate and acquire a concurrency permit.
    ///
    /// Waiting for a permit is FIFO, so a burst cannot starve earlier
    /// requesters. An exhausted rate bucket does not wait: the caller's
    /// retry loop provides the backoff.
    pub(crate) async fn begin_dispatch(&self) -> Result<DispatchPermit, DispatchFailure> {
        if let Some(bucket) = &self.rate {
            if !bucket.try_acquire().await {
                self.metrics.record_rate_limited(&self.name);
                return Err(DispatchFailure::Provider(
                    "outbound rate limit exceeded".to_string(),
                ));
            }
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchFailure::Provider("pushkin is shut down".to_string()))?;

        self.metrics.add_inflight(&self.name, 1);
        Ok(DispatchPermit {
            _permit: permit,
            metrics: self.metrics.clone(),
            name: self.name.clone(),
        })
    }

    /// Stop admitting new dispatches. Idempotent; in-flight requests finish.
    pub(crate) fn shutdown(&self) {
        self.semaphore.close();
    }
}

/// Held for the duration of one outbound request.
#[derive(Debug)]
pub(crate) struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<Metrics>,
    name: String,
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        self.metrics.add_inflight(&self.name, -1);
    }
}

/// A configured pushkin instance.
///
/// A tagged set of concrete workers rather than a trait object: the variants
/// are known at compile time and dispatch is a match.
pub enum Pushkin {
    /// Apple Push Notification service.
    Apns(ApnsPushkin),
    /// Firebase Cloud Messaging.
    Gcm(FcmPushkin),
    /// Generic Web Push.
    WebPush(WebPushPushkin),
}

impl Pushkin {
    /// Stable identity for metrics and logging: the configured app id pattern.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Apns(p) => p.name(),
            Self::Gcm(p) => p.name(),
            Self::WebPush(p) => p.name(),
        }
    }

    /// Provider type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Apns(_) => "apns",
            Self::Gcm(_) => "gcm",
            Self::WebPush(_) => "webpush",
        }
    }

    /// Deliver one notification to one device.
    pub async fn dispatch_notification(
        &self,
        notification: &Notification,
        device: &Device,
    ) -> DispatchResult {
        match self {
            Self::Apns(p) => p.dispatch_notification(notification, device).await,
            Self::Gcm(p) => p.dispatch_notification(notification, device).await,
            Self::WebPush(p) => p.dispatch_notification(notification, device).await,
        }
    }

    /// Stop admitting new dispatches. Idempotent.
    pub fn shutdown(&self) {
        match self {
            Self::Apns(p) => p.shutdown(),
            Self::Gcm(p) => p.shutdown(),
            Self::WebPush(p) => p.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn core(max_connections: usize, rate_limit: Option<RateLimitConfig>) -> Arc<PushkinCore> {
        Arc::new(PushkinCore::new(
            "com.example.test".to_string(),
            max_connections,
            rate_limit,
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            DispatchFailure::Provider("x".to_string()).outcome_label(),
            "transient"
        );
        assert_eq!(
            DispatchFailure::Auth("x".to_string()).outcome_label(),
            "auth"
        );
        assert_eq!(
            DispatchFailure::BadConfig("x".to_string()).outcome_label(),
            "bad_config"
        );
        assert_eq!(DispatchFailure::Timeout.outcome_label(), "timeout");
    }

    #[tokio::test]
    async fn test_permit_bounds_concurrency() {
        let core = core(3, None);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let core = core.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = core.begin_dispatch().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_permit_updates_inflight_gauge() {
        let core = core(2, None);
        let gauge = || {
            core.metrics()
                .inflight_permits
                .with_label_values(&["com.example.test"])
                .get()
        };

        let permit = core.begin_dispatch().await.unwrap();
        assert_eq!(gauge(), 1);
        drop(permit);
        assert_eq!(gauge(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_dispatches() {
        let core = core(1, None);
        core.shutdown();
        core.shutdown(); // idempotent

        let err = core.begin_dispatch().await.unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }

    #[tokio::test]
    async fn test_rate_bucket_backpressure() {
        let core = core(
            10,
            Some(RateLimitConfig {
                requests_per_second: 1,
                burst: Some(1),
            }),
        );

        let _permit = core.begin_dispatch().await.unwrap();
        let err = core.begin_dispatch().await.unwrap_err();
        assert!(matches!(err, DispatchFailure::Provider(_)));
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_nothing() {
        let core = core(1, None);

        let held = core.begin_dispatch().await.unwrap();

        // A waiter blocked on the full semaphore, then cancelled.
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move {
                let _ = core.begin_dispatch().await;
            })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The held permit is still the only one; releasing it frees the slot.
        drop(held);
        let _permit = core.begin_dispatch().await.unwrap();
    }
}
