//! Configuration loading and management.
//!
//! Supports YAML configuration files with environment variable overrides.
//! Environment variables follow the pattern: `PUSHGATE_<SECTION>__<KEY>`

use std::collections::BTreeMap;
use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Configured apps, keyed by app id (exact string or glob pattern).
    #[serde(default)]
    pub apps: BTreeMap<String, PushkinConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub log: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Optional forward proxy URL for outbound provider traffic.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Optional PEM bundle of additional trust anchors for provider TLS.
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Overall timeout for one `/notify` request, in seconds.
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Addresses to bind; one listener is started per address.
    #[serde(default = "default_bind_addresses")]
    pub bind_addresses: Vec<String>,

    /// Port shared by all listeners.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addresses: default_bind_addresses(),
            port: default_port(),
        }
    }
}

fn default_bind_addresses() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}

fn default_port() -> u16 {
    5000
}

/// Per-app pushkin configuration, tagged by provider type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushkinConfig {
    /// Apple Push Notification service.
    Apns(ApnsConfig),
    /// Firebase Cloud Messaging (the `gcm` name is kept for caller compatibility).
    Gcm(FcmConfig),
    /// Generic Web Push (RFC 8030 + VAPID).
    Webpush(WebPushConfig),
}

impl PushkinConfig {
    /// Provider type name, used for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Apns(_) => "apns",
            Self::Gcm(_) => "gcm",
            Self::Webpush(_) => "webpush",
        }
    }

    /// Validate the type-specific fields, naming the app in any error.
    pub fn validate(&self, app_id: &str) -> Result<()> {
        match self {
            Self::Apns(c) => c.validate(app_id),
            Self::Gcm(c) => c.validate(app_id),
            Self::Webpush(c) => c.validate(app_id),
        }
    }
}

/// Default bound on concurrent outbound requests per pushkin.
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

/// Optional token-bucket limit on outbound request rate.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub requests_per_second: u32,

    /// Burst size; defaults to `requests_per_second` when omitted.
    #[serde(default)]
    pub burst: Option<u32>,
}

/// APNs pushkin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApnsConfig {
    /// Path to a combined certificate + key PEM file for certificate auth.
    #[serde(default)]
    pub certfile: String,

    /// Path to the .p8 private key file for token auth.
    #[serde(default)]
    pub keyfile: String,

    /// Key ID for token-based auth.
    #[serde(default)]
    pub key_id: String,

    /// Team ID for token-based auth.
    #[serde(default)]
    pub team_id: String,

    /// APNs topic (the app bundle id).
    #[serde(default)]
    pub topic: String,

    /// APNs environment: "production" or "sandbox".
    #[serde(default = "default_apns_platform")]
    pub platform: String,

    /// Maximum concurrent outbound requests.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Send identifiers only, never message content.
    #[serde(default)]
    pub event_id_only: bool,

    /// Optional outbound rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_apns_platform() -> String {
    "production".to_string()
}

impl ApnsConfig {
    /// Returns true if targeting the production APNs environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.platform == "production"
    }

    /// Returns the APNs base URL for the configured environment.
    #[must_use]
    pub fn base_url(&self) -> &'static str {
        if self.is_production() {
            "https://api.push.apple.com"
        } else {
            "https://api.sandbox.push.apple.com"
        }
    }

    fn validate(&self, app_id: &str) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::Setup(format!("app '{app_id}': 'topic' is required")));
        }
        if self.platform != "production" && self.platform != "sandbox" {
            return Err(Error::Setup(format!(
                "app '{app_id}': 'platform' must be 'production' or 'sandbox', got '{}'",
                self.platform
            )));
        }

        let has_cert = !self.certfile.is_empty();
        let has_token =
            !self.keyfile.is_empty() || !self.key_id.is_empty() || !self.team_id.is_empty();

        match (has_cert, has_token) {
            (true, true) => Err(Error::Setup(format!(
                "app '{app_id}': 'certfile' and 'keyfile'/'key_id'/'team_id' are mutually exclusive"
            ))),
            (false, false) => Err(Error::Setup(format!(
                "app '{app_id}': either 'certfile' or 'keyfile' + 'key_id' + 'team_id' is required"
            ))),
            (false, true)
                if self.keyfile.is_empty() || self.key_id.is_empty() || self.team_id.is_empty() =>
            {
                Err(Error::Setup(format!(
                    "app '{app_id}': token auth needs all of 'keyfile', 'key_id' and 'team_id'"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// FCM pushkin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FcmConfig {
    /// Path to the Google service account JSON file (HTTP v1 auth).
    #[serde(default)]
    pub service_account_file: String,

    /// Legacy server API key; selects the legacy HTTP endpoint.
    #[serde(default)]
    pub api_key: String,

    /// FCM project ID; falls back to the service account's project.
    #[serde(default)]
    pub project_id: String,

    /// Maximum concurrent outbound requests.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Send identifiers only, never message content.
    #[serde(default)]
    pub event_id_only: bool,

    /// Extra `fcm_options` object passed through on every message.
    #[serde(default)]
    pub fcm_options: Option<serde_json::Value>,

    /// Optional outbound rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl FcmConfig {
    fn validate(&self, app_id: &str) -> Result<()> {
        if self.service_account_file.is_empty() && self.api_key.is_empty() {
            return Err(Error::Setup(format!(
                "app '{app_id}': either 'service_account_file' or 'api_key' is required"
            )));
        }
        if !self.service_account_file.is_empty() && !self.api_key.is_empty() {
            return Err(Error::Setup(format!(
                "app '{app_id}': 'service_account_file' and 'api_key' are mutually exclusive"
            )));
        }
        Ok(())
    }
}

/// Web Push pushkin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebPushConfig {
    /// Path to the VAPID ES256 private key PEM file.
    #[serde(default)]
    pub vapid_private_key: String,

    /// VAPID contact URI, e.g. `mailto:admin@example.com`.
    #[serde(default)]
    pub vapid_contact_uri: String,

    /// Maximum concurrent outbound requests.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Substrings an endpoint URL must contain to be accepted; empty allows all.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,

    /// Include sender/room/content fields in the payload instead of ids only.
    #[serde(default)]
    pub full_payload: bool,

    /// TTL header value in seconds.
    #[serde(default = "default_webpush_ttl")]
    pub ttl: u64,

    /// Optional outbound rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_webpush_ttl() -> u64 {
    15
}

impl WebPushConfig {
    fn validate(&self, app_id: &str) -> Result<()> {
        if self.vapid_private_key.is_empty() {
            return Err(Error::Setup(format!(
                "app '{app_id}': 'vapid_private_key' is required"
            )));
        }
        if self.vapid_contact_uri.is_empty() {
            return Err(Error::Setup(format!(
                "app '{app_id}': 'vapid_contact_uri' is required"
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", "off".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the /metrics endpoint is enabled.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

impl GatewayConfig {
    /// Load configuration from a file path with environment variable overrides.
    ///
    /// Environment variables follow the pattern: `PUSHGATE_<SECTION>__<KEY>`
    /// For example: `PUSHGATE_HTTP__PORT=5001`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("PUSHGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the loaded configuration before any pushkin is built.
    pub fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(Error::Setup("no apps configured".to_string()));
        }
        for (app_id, pushkin) in &self.apps {
            pushkin.validate(app_id)?;
        }
        if self.http.bind_addresses.is_empty() {
            return Err(Error::Setup(
                "http.bind_addresses must not be empty".to_string(),
            ));
        }
        if self.notify_timeout_secs == 0 {
            return Err(Error::Setup(
                "notify_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
