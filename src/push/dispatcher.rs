//! Notification routing and dispatch.
//!
//! The registry maps app ids onto configured pushkins; the dispatcher fans a
//! notification out to every routable device concurrently, collates the
//! per-device outcomes, and reduces them to the single reply the caller
//! understands: a rejected-pushkey list, or a transient failure.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::push::notification::{Device, Notification};
use crate::push::{DispatchFailure, DispatchOutcome, Pushkin};

/// Maps app ids to pushkins.
///
/// Entries are kept in lexicographic pattern order so glob resolution is
/// deterministic regardless of config-file ordering.
#[derive(Default)]
pub struct PushkinRegistry {
    entries: Vec<(String, Arc<Pushkin>)>,
}

impl PushkinRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pushkin under an app id pattern.
    pub fn insert(&mut self, pattern: String, pushkin: Pushkin) {
        self.entries.push((pattern, Arc::new(pushkin)));
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Resolve the pushkin handling an app id.
    ///
    /// An exact entry always wins. Otherwise the first matching glob pattern
    /// is used; overlapping patterns are an operator error and are logged.
    pub fn resolve(&self, app_id: &str) -> Option<&Arc<Pushkin>> {
        if let Some((_, pushkin)) = self.entries.iter().find(|(pattern, _)| pattern == app_id) {
            return Some(pushkin);
        }

        let mut matches = self
            .entries
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, app_id));
        let first = matches.next();
        if first.is_some() && matches.next().is_some() {
            warn!(
                app_id,
                "App id matches more than one configured pattern; using the first"
            );
        }
        first.map(|(_, pushkin)| pushkin)
    }

    /// Number of configured pushkins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shut down every pushkin. Idempotent.
    pub fn shutdown_all(&self) {
        for (_, pushkin) in &self.entries {
            pushkin.shutdown();
        }
    }
}

/// Glob matching for app id patterns: `*` matches any run of characters,
/// `?` matches exactly one.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    fn matches(pattern: &[char], value: &[char]) -> bool {
        match pattern.first() {
            None => value.is_empty(),
            Some('*') => {
                matches(&pattern[1..], value)
                    || (!value.is_empty() && matches(pattern, &value[1..]))
            }
            Some('?') => !value.is_empty() && matches(&pattern[1..], &value[1..]),
            Some(c) => value.first() == Some(c) && matches(&pattern[1..], &value[1..]),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    matches(&pattern, &value)
}

/// Fans notifications out to pushkins and collates the results.
pub struct NotificationDispatcher {
    registry: PushkinRegistry,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl NotificationDispatcher {
    /// Create a dispatcher over a registry of configured pushkins.
    pub fn new(registry: PushkinRegistry, metrics: Arc<Metrics>, timeout: Duration) -> Self {
        Self {
            registry,
            metrics,
            timeout,
        }
    }

    /// Dispatch a notification to all of its devices.
    ///
    /// Returns the pushkeys to reject, in device order. Devices with no
    /// matching pushkin are skipped: another gateway may handle them. Any
    /// transient per-device failure fails the whole call, because the reply
    /// format has no way to ask for a partial retry.
    pub async fn dispatch(
        &self,
        notification: &Notification,
    ) -> Result<Vec<String>, DispatchFailure> {
        let mut targets: Vec<(&Device, &Arc<Pushkin>)> = Vec::new();
        for device in &notification.devices {
            match self.registry.resolve(&device.app_id) {
                Some(pushkin) => {
                    debug!(
                        app_id = device.app_id,
                        pushkin = pushkin.name(),
                        kind = pushkin.kind(),
                        "Routing device"
                    );
                    targets.push((device, pushkin));
                }
                None => {
                    warn!(
                        app_id = device.app_id,
                        "No pushkin handles this app id, skipping device"
                    );
                    self.metrics.record_device_ignored();
                }
            }
        }

        let dispatches = targets.iter().map(|(device, pushkin)| async move {
            let result = pushkin.dispatch_notification(notification, device).await;
            let outcome = match &result {
                Ok(DispatchOutcome::Accepted) => "accepted",
                Ok(DispatchOutcome::Rejected(_)) => "rejected",
                Err(failure) => failure.outcome_label(),
            };
            self.metrics.record_dispatch(pushkin.name(), outcome);
            result
        });

        let results = match tokio::time::timeout(self.timeout, join_all(dispatches)).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Notification dispatch timed out; cancelling in-flight sends"
                );
                return Err(DispatchFailure::Timeout);
            }
        };

        let mut rejected = Vec::new();
        let mut failure = None;
        for ((device, pushkin), result) in targets.iter().zip(results) {
            match result {
                Ok(DispatchOutcome::Accepted) => {}
                Ok(DispatchOutcome::Rejected(pushkey)) => rejected.push(pushkey),
                Err(e) => {
                    warn!(
                        pushkin = pushkin.name(),
                        app_id = device.app_id,
                        error = %e,
                        "Dispatch failed"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(rejected),
        }
    }

    /// Shut down every pushkin. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown_all();
    }
}
