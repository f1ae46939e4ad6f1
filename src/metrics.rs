//! Prometheus metrics for operational visibility.
//!
//! This module provides metrics for monitoring the health and performance of
//! the gateway without exposing any sensitive information like device tokens
//! or message content.
//!
//! # Security Considerations
//!
//! All metrics are designed to be safe for exposure:
//! - No pushkeys, user IDs, or notification content
//! - Pushkin labels are the configured app id patterns, not device data
//! - Only aggregate counts and operational statistics

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

/// All metrics for the push gateway.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// The Prometheus registry containing all metrics.
    pub registry: Registry,

    // === Ingress Metrics ===
    /// Total number of notification pokes received.
    pub notifications_received_total: IntCounter,

    /// Total number of devices asked to push.
    pub devices_received_total: IntCounter,

    /// Total number of devices ignored because no pushkin matched.
    pub devices_ignored_total: IntCounter,

    /// HTTP response codes given on the push gateway API.
    pub http_responses_total: IntCounterVec,

    /// Time taken to handle a /notify request, by response code.
    pub notify_duration_seconds: HistogramVec,

    // === Dispatch Metrics ===
    /// Per-device dispatch outcomes, by pushkin and outcome class.
    pub dispatch_total: IntCounterVec,

    /// Duration of provider requests in seconds, by pushkin.
    pub dispatch_duration_seconds: HistogramVec,

    /// Provider HTTP response statuses, by pushkin.
    pub provider_status_total: IntCounterVec,

    /// Outbound requests currently holding a concurrency permit, by pushkin.
    pub inflight_permits: IntGaugeVec,

    /// Dispatches refused by the outbound rate limiter, by pushkin.
    pub rate_limited_total: IntCounterVec,

    // === Auth Metrics ===
    /// Credential refresh attempts, by pushkin and result.
    pub token_refreshes_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let notifications_received_total = IntCounter::with_opts(Opts::new(
            "pushgate_notifications_received_total",
            "Number of notification pokes received",
        ))?;
        registry.register(Box::new(notifications_received_total.clone()))?;

        let devices_received_total = IntCounter::with_opts(Opts::new(
            "pushgate_devices_received_total",
            "Number of devices asked to push",
        ))?;
        registry.register(Box::new(devices_received_total.clone()))?;

        let devices_ignored_total = IntCounter::with_opts(Opts::new(
            "pushgate_devices_ignored_total",
            "Number of devices skipped because no pushkin matched their app id",
        ))?;
        registry.register(Box::new(devices_ignored_total.clone()))?;

        let http_responses_total = IntCounterVec::new(
            Opts::new(
                "pushgate_http_responses_total",
                "HTTP response codes given on the push gateway API",
            ),
            &["code"],
        )?;
        registry.register(Box::new(http_responses_total.clone()))?;

        let notify_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pushgate_notify_duration_seconds",
                "Time taken to handle a /notify request",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["code"],
        )?;
        registry.register(Box::new(notify_duration_seconds.clone()))?;

        let dispatch_total = IntCounterVec::new(
            Opts::new(
                "pushgate_dispatch_total",
                "Per-device dispatch outcomes by pushkin",
            ),
            &["pushkin", "outcome"],
        )?;
        registry.register(Box::new(dispatch_total.clone()))?;

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pushgate_dispatch_duration_seconds",
                "Duration of provider requests in seconds",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["pushkin"],
        )?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;

        let provider_status_total = IntCounterVec::new(
            Opts::new(
                "pushgate_provider_status_total",
                "Provider HTTP response statuses",
            ),
            &["pushkin", "status"],
        )?;
        registry.register(Box::new(provider_status_total.clone()))?;

        let inflight_permits = IntGaugeVec::new(
            Opts::new(
                "pushgate_inflight_permits",
                "Outbound requests currently holding a concurrency permit",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(inflight_permits.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "pushgate_rate_limited_total",
                "Dispatches refused by the outbound rate limiter",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let token_refreshes_total = IntCounterVec::new(
            Opts::new(
                "pushgate_token_refreshes_total",
                "Credential refresh attempts by pushkin and result",
            ),
            &["pushkin", "result"],
        )?;
        registry.register(Box::new(token_refreshes_total.clone()))?;

        Ok(Self {
            registry,
            notifications_received_total,
            devices_received_total,
            devices_ignored_total,
            http_responses_total,
            notify_duration_seconds,
            dispatch_total,
            dispatch_duration_seconds,
            provider_status_total,
            inflight_permits,
            rate_limited_total,
            token_refreshes_total,
        })
    }

    /// Record a received notification poke with its device count.
    pub fn record_notification_received(&self, devices: usize) {
        self.notifications_received_total.inc();
        self.devices_received_total.inc_by(devices as u64);
    }

    /// Record a device skipped because no pushkin matched.
    pub fn record_device_ignored(&self) {
        self.devices_ignored_total.inc();
    }

    /// Record the response code and handling time of a /notify request.
    pub fn record_notify_response(&self, code: u16, duration_secs: f64) {
        let code = code.to_string();
        self.http_responses_total.with_label_values(&[&code]).inc();
        self.notify_duration_seconds
            .with_label_values(&[&code])
            .observe(duration_secs);
    }

    /// Record a per-device dispatch outcome.
    pub fn record_dispatch(&self, pushkin: &str, outcome: &str) {
        self.dispatch_total
            .with_label_values(&[pushkin, outcome])
            .inc();
    }

    /// Observe the duration of one provider request.
    pub fn observe_dispatch_duration(&self, pushkin: &str, duration_secs: f64) {
        self.dispatch_duration_seconds
            .with_label_values(&[pushkin])
            .observe(duration_secs);
    }

    /// Record a provider HTTP response status.
    pub fn record_provider_status(&self, pushkin: &str, status: u16) {
        self.provider_status_total
            .with_label_values(&[pushkin, &status.to_string()])
            .inc();
    }

    /// Adjust the in-flight permit gauge for a pushkin.
    pub fn add_inflight(&self, pushkin: &str, delta: i64) {
        self.inflight_permits
            .with_label_values(&[pushkin])
            .add(delta);
    }

    /// Record a dispatch refused by the rate limiter.
    pub fn record_rate_limited(&self, pushkin: &str) {
        self.rate_limited_total.with_label_values(&[pushkin]).inc();
    }

    /// Record a credential refresh attempt.
    pub fn record_token_refresh(&self, pushkin: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.token_refreshes_total
            .with_label_values(&[pushkin, result])
            .inc();
    }

    /// Gather all metrics for export.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        // All families register without name collisions.
        assert!(!metrics.gather().is_empty());
    }

    #[test]
    fn test_ingress_metrics() {
        let metrics = Metrics::new().unwrap();

        metrics.record_notification_received(3);
        metrics.record_device_ignored();
        metrics.record_notify_response(200, 0.05);
        metrics.record_notify_response(502, 1.2);

        assert_eq!(metrics.notifications_received_total.get(), 1);
        assert_eq!(metrics.devices_received_total.get(), 3);
        assert_eq!(metrics.devices_ignored_total.get(), 1);
        assert!(!metrics.gather().is_empty());
    }

    #[test]
    fn test_dispatch_metrics() {
        let metrics = Metrics::new().unwrap();

        metrics.record_dispatch("com.example.ios", "accepted");
        metrics.record_dispatch("com.example.ios", "rejected");
        metrics.record_dispatch("com.example.android", "transient");
        metrics.observe_dispatch_duration("com.example.ios", 0.125);
        metrics.record_provider_status("com.example.ios", 200);
        metrics.record_rate_limited("com.example.android");

        assert!(!metrics.gather().is_empty());
    }

    #[test]
    fn test_inflight_gauge() {
        let metrics = Metrics::new().unwrap();

        metrics.add_inflight("com.example.ios", 1);
        metrics.add_inflight("com.example.ios", 1);
        metrics.add_inflight("com.example.ios", -1);

        assert_eq!(
            metrics
                .inflight_permits
                .with_label_values(&["com.example.ios"])
                .get(),
            1
        );
    }

    #[test]
    fn test_token_refresh_metrics() {
        let metrics = Metrics::new().unwrap();

        metrics.record_token_refresh("com.example.ios", true);
        metrics.record_token_refresh("com.example.ios", false);

        assert_eq!(
            metrics
                .token_refreshes_total
                .with_label_values(&["com.example.ios", "ok"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .token_refreshes_total
                .with_label_values(&["com.example.ios", "error"])
                .get(),
            1
        );
    }
}
