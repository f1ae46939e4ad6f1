//! Firebase Cloud Messaging pushkin.
//!
//! Speaks the HTTP v1 API with OAuth2 service-account authentication, or the
//! legacy HTTP API with a server key. The configured type name stays `gcm`
//! for caller compatibility.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::FcmConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::push::auth::TokenCache;
use crate::push::http::{self, ClientOptions};
use crate::push::notification::{Device, Notification};
use crate::push::{DispatchFailure, DispatchOutcome, DispatchResult, PushkinCore};

/// OAuth2 scope for FCM sends.
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Legacy HTTP API endpoint.
const LEGACY_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// Refresh access tokens this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Service account JSON structure.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServiceAccount {
    pub(crate) project_id: String,
    pub(crate) private_key: String,
    pub(crate) client_email: String,
    pub(crate) token_uri: String,
}

/// JWT claims for the OAuth2 JWT-bearer exchange.
#[derive(Debug, Serialize)]
struct OAuthClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

/// OAuth2 token request.
#[derive(Debug, Serialize)]
struct TokenRequest {
    grant_type: String,
    assertion: String,
}

/// OAuth2 token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// HTTP v1 message envelope.
#[derive(Debug, Serialize)]
struct V1Request {
    message: V1Message,
}

#[derive(Debug, Serialize)]
struct V1Message {
    token: String,
    android: AndroidConfig,
    data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fcm_options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AndroidConfig {
    priority: String,
}

/// Legacy API message envelope.
#[derive(Debug, Serialize)]
struct LegacyRequest {
    to: String,
    priority: String,
    data: BTreeMap<String, String>,
}

/// Fields we read out of a 200 response, across both API flavours.
#[derive(Debug, Deserialize)]
struct SendResponse {
    /// v1: canonical registration id, if the endpoint reports one.
    registration_id: Option<String>,
    /// Legacy: one result per registration id sent (always one here).
    results: Option<Vec<LegacyResult>>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    registration_id: Option<String>,
    error: Option<String>,
}

/// v1 error response body.
#[derive(Debug, Deserialize)]
struct V1ErrorResponse {
    error: V1Error,
}

#[derive(Debug, Deserialize)]
struct V1Error {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Authentication mode, fixed at construction.
enum FcmAuth {
    /// HTTP v1: OAuth2 access tokens minted from a service account key.
    ServiceAccount {
        account: ServiceAccount,
        encoding_key: EncodingKey,
        token_cache: TokenCache,
    },
    /// Legacy server key.
    ApiKey(String),
}

impl std::fmt::Debug for FcmAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FcmAuth::ServiceAccount {
                account,
                token_cache,
                ..
            } => f
                .debug_struct("ServiceAccount")
                .field("account", account)
                .field("encoding_key", &true)
                .field("token_cache", token_cache)
                .finish(),
            FcmAuth::ApiKey(key) => f.debug_tuple("ApiKey").field(key).finish(),
        }
    }
}

/// FCM pushkin.
#[derive(Debug)]
pub struct FcmPushkin {
    core: PushkinCore,
    config: FcmConfig,
    http_client: Client,
    auth: FcmAuth,
    send_url: String,
}

impl FcmPushkin {
    /// Create a new FCM pushkin for one configured app.
    pub async fn new(
        name: String,
        config: FcmConfig,
        options: &ClientOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let http_client = http::build_client(options, false, None).await?;

        let (auth, send_url) = if !config.service_account_file.is_empty() {
            let data = tokio::fs::read_to_string(&config.service_account_file)
                .await
                .map_err(|e| {
                    Error::Fcm(format!(
                        "Failed to read service account file '{}': {e}",
                        config.service_account_file
                    ))
                })?;
            let account: ServiceAccount = serde_json::from_str(&data)
                .map_err(|e| Error::Fcm(format!("Failed to parse service account JSON: {e}")))?;
            let encoding_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
                .map_err(|e| Error::Fcm(format!("Failed to parse service account key: {e}")))?;

            let project_id = if config.project_id.is_empty() {
                account.project_id.clone()
            } else {
                config.project_id.clone()
            };
            let send_url =
                format!("https://fcm.googleapis.com/v1/projects/{project_id}/messages:send");

            (
                FcmAuth::ServiceAccount {
                    account,
                    encoding_key,
                    token_cache: TokenCache::new(TOKEN_REFRESH_MARGIN),
                },
                send_url,
            )
        } else {
            (
                FcmAuth::ApiKey(config.api_key.clone()),
                LEGACY_SEND_URL.to_string(),
            )
        };

        Ok(Self {
            core: PushkinCore::new(name, config.max_connections, config.rate_limit, metrics),
            config,
            http_client,
            auth,
            send_url,
        })
    }

    /// Stable identity for metrics and logging.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Stop admitting new dispatches. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Deliver one notification to one device.
    pub async fn dispatch_notification(
        &self,
        notification: &Notification,
        device: &Device,
    ) -> DispatchResult {
        let _permit = self.core.begin_dispatch().await?;
        let start = Instant::now();
        let result = self.dispatch_inner(notification, device).await;
        self.core
            .metrics()
            .observe_dispatch_duration(self.core.name(), start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_inner(&self, notification: &Notification, device: &Device) -> DispatchResult {
        let event_id_only = self.config.event_id_only || device.event_id_only();
        let data = build_data(notification, event_id_only);
        let priority = if notification.prio.is_high() {
            "high"
        } else {
            "normal"
        };

        let mut refreshed_token = false;
        loop {
            let request = self.http_client.post(&self.send_url);
            let request = match &self.auth {
                FcmAuth::ServiceAccount { .. } => {
                    let access_token = self
                        .access_token()
                        .await
                        .map_err(|e| DispatchFailure::Auth(e.to_string()))?;
                    request
                        .header("authorization", format!("Bearer {access_token}"))
                        .json(&V1Request {
                            message: V1Message {
                                token: device.pushkey.clone(),
                                android: AndroidConfig {
                                    priority: priority.to_string(),
                                },
                                data: data.clone(),
                                fcm_options: self.config.fcm_options.clone(),
                            },
                        })
                }
                FcmAuth::ApiKey(key) => request
                    .header("authorization", format!("key={key}"))
                    .json(&LegacyRequest {
                        to: device.pushkey.clone(),
                        priority: priority.to_string(),
                        data: data.clone(),
                    }),
            };

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(pushkin = self.core.name(), error = %e, "FCM request failed");
                    return Err(DispatchFailure::Provider(format!("FCM request failed: {e}")));
                }
            };

            let status = response.status().as_u16();
            self.core
                .metrics()
                .record_provider_status(self.core.name(), status);

            match status {
                200 => return self.classify_success(response, device).await,
                401 => {
                    if let FcmAuth::ServiceAccount { token_cache, .. } = &self.auth {
                        if !refreshed_token {
                            debug!(
                                pushkin = self.core.name(),
                                "Access token rejected mid-flight, refreshing"
                            );
                            refreshed_token = true;
                            token_cache.invalidate().await;
                            continue;
                        }
                        return Err(DispatchFailure::Auth(
                            "FCM kept rejecting a freshly minted access token".to_string(),
                        ));
                    }
                    error!(
                        pushkin = self.core.name(),
                        "FCM rejected the configured API key; this gateway is misconfigured"
                    );
                    return Err(DispatchFailure::BadConfig(
                        "FCM rejected the API key".to_string(),
                    ));
                }
                404 => {
                    debug!(pushkin = self.core.name(), "FCM token not found");
                    return Ok(DispatchOutcome::Rejected(device.pushkey.clone()));
                }
                400 => return self.classify_bad_request(response, device).await,
                429 => {
                    warn!(pushkin = self.core.name(), "Rate limited by FCM");
                    return Err(DispatchFailure::Provider("rate limited by FCM".to_string()));
                }
                500..=599 => {
                    debug!(pushkin = self.core.name(), status, "FCM server error");
                    return Err(DispatchFailure::Provider(format!(
                        "FCM server error: {status}"
                    )));
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    error!(
                        pushkin = self.core.name(),
                        status,
                        %body,
                        "Unexpected FCM response; this gateway is likely misconfigured"
                    );
                    return Err(DispatchFailure::BadConfig(format!(
                        "unexpected FCM response: {status}"
                    )));
                }
            }
        }
    }

    /// A 200 either means delivered, or carries a canonical registration id
    /// (or a legacy per-result error) that condemns the pushkey we sent.
    async fn classify_success(
        &self,
        response: reqwest::Response,
        device: &Device,
    ) -> DispatchResult {
        let body: SendResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(pushkin = self.core.name(), error = %e, "Unparseable FCM success body");
                return Err(DispatchFailure::Provider(format!(
                    "unparseable FCM response: {e}"
                )));
            }
        };

        let mut canonical = body.registration_id;
        if let Some(results) = body.results
            && let Some(result) = results.into_iter().next()
        {
            if let Some(error) = result.error {
                return if matches!(
                    error.as_str(),
                    "NotRegistered" | "InvalidRegistration" | "MissingRegistration"
                ) {
                    debug!(pushkin = self.core.name(), %error, "FCM rejected the pushkey");
                    Ok(DispatchOutcome::Rejected(device.pushkey.clone()))
                } else if matches!(error.as_str(), "Unavailable" | "InternalServerError") {
                    Err(DispatchFailure::Provider(format!("FCM send error: {error}")))
                } else {
                    error!(
                        pushkin = self.core.name(),
                        %error,
                        "FCM reported a send error; this gateway is likely misconfigured"
                    );
                    Err(DispatchFailure::BadConfig(format!(
                        "FCM send error: {error}"
                    )))
                };
            }
            canonical = canonical.or(result.registration_id);
        }

        // The provider knows this registration under a different id. We do
        // not rewrite registrations: condemn the key we were given so the
        // caller re-registers.
        if let Some(canonical) = canonical
            && canonical != device.pushkey
        {
            info!(
                pushkin = self.core.name(),
                "FCM reported a canonical registration id, rejecting the stale pushkey"
            );
            return Ok(DispatchOutcome::Rejected(device.pushkey.clone()));
        }

        trace!(pushkin = self.core.name(), "FCM accepted the notification");
        Ok(DispatchOutcome::Accepted)
    }

    async fn classify_bad_request(
        &self,
        response: reqwest::Response,
        device: &Device,
    ) -> DispatchResult {
        let error = response
            .json::<V1ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or(V1Error {
                message: "Unknown".to_string(),
                status: "UNKNOWN".to_string(),
            });

        let message = error.message.to_lowercase();
        if error.status == "UNREGISTERED"
            || (error.status == "INVALID_ARGUMENT"
                && (message.contains("token") || message.contains("registration")))
        {
            debug!(pushkin = self.core.name(), status = %error.status, "FCM rejected the pushkey");
            return Ok(DispatchOutcome::Rejected(device.pushkey.clone()));
        }

        error!(
            pushkin = self.core.name(),
            status = %error.status,
            message = %error.message,
            "FCM says this gateway is misconfigured"
        );
        Err(DispatchFailure::BadConfig(format!(
            "FCM bad request: {} - {}",
            error.status, error.message
        )))
    }

    /// Get a valid OAuth2 access token, refreshing if necessary.
    async fn access_token(&self) -> Result<String> {
        let FcmAuth::ServiceAccount { token_cache, .. } = &self.auth else {
            return Err(Error::Fcm("No service account configured".to_string()));
        };
        token_cache
            .get(|| async {
                let result = self.exchange_token().await;
                self.core
                    .metrics()
                    .record_token_refresh(self.core.name(), result.is_ok());
                result
            })
            .await
    }

    /// Perform the OAuth2 JWT-bearer exchange against the token endpoint.
    async fn exchange_token(&self) -> Result<(String, Duration)> {
        let FcmAuth::ServiceAccount {
            account,
            encoding_key,
            ..
        } = &self.auth
        else {
            return Err(Error::Fcm("No service account configured".to_string()));
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Fcm(format!("System time error: {e}")))?
            .as_secs();

        let claims = OAuthClaims {
            iss: account.client_email.clone(),
            scope: FCM_SCOPE.to_string(),
            aud: account.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };

        let assertion = encode(&Header::new(Algorithm::RS256), &claims, encoding_key)?;

        let request = TokenRequest {
            grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer".to_string(),
            assertion,
        };

        let response = self
            .http_client
            .post(&account.token_uri)
            .form(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fcm(format!(
                "OAuth token request failed: {status} - {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;

        trace!(pushkin = self.core.name(), "Refreshed FCM access token");
        Ok((token.access_token, Duration::from_secs(token.expires_in)))
    }
}

/// Build the stringified data map sent to the device.
fn build_data(notification: &Notification, event_id_only: bool) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();

    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            data.insert(key.to_string(), value);
        }
    };

    put("event_id", notification.event_id.clone());
    put("room_id", notification.room_id.clone());
    put("unread", notification.unread().map(|n| n.to_string()));
    put(
        "missed_calls",
        notification.missed_calls().map(|n| n.to_string()),
    );
    put(
        "prio",
        Some(if notification.prio.is_high() { "high" } else { "low" }.to_string()),
    );

    if !event_id_only {
        put("type", notification.event_type.clone());
        put("sender", notification.sender.clone());
        put(
            "sender_display_name",
            notification.sender_display_name.clone(),
        );
        put("room_name", notification.room_name.clone());
        put("room_alias", notification.room_alias.clone());
        if let Some(content) = &notification.content {
            // Data values must be strings on the wire.
            put("content", Some(content.to_string()));
        }
    }

    data
}

#[cfg(test)]
impl FcmPushkin {
    /// HTTP v1 pushkin for tests, pointed at a stub server with a primed
    /// access token so no exchange happens.
    pub(crate) async fn mock_v1(name: &str, config: FcmConfig, send_url: String) -> Self {
        let token_cache = TokenCache::new(TOKEN_REFRESH_MARGIN);
        token_cache
            .prime("test-access-token", Duration::from_secs(3600))
            .await;
        Self {
            core: PushkinCore::new(
                name.to_string(),
                config.max_connections,
                config.rate_limit,
                Arc::new(Metrics::new().unwrap()),
            ),
            config,
            http_client: Client::new(),
            auth: FcmAuth::ServiceAccount {
                account: ServiceAccount {
                    project_id: "test-project".to_string(),
                    private_key: String::new(),
                    client_email: "test@test.iam.gserviceaccount.com".to_string(),
                    token_uri: "https://oauth2.googleapis.com/token".to_string(),
                },
                encoding_key: EncodingKey::from_secret(b"unused"),
                token_cache,
            },
            send_url,
        }
    }

    /// Legacy-auth pushkin for tests.
    pub(crate) fn mock_legacy(name: &str, config: FcmConfig, send_url: String) -> Self {
        let api_key = config.api_key.clone();
        Self {
            core: PushkinCore::new(
                name.to_string(),
                config.max_connections,
                config.rate_limit,
                Arc::new(Metrics::new().unwrap()),
            ),
            config,
            http_client: Client::new(),
            auth: FcmAuth::ApiKey(api_key),
            send_url,
        }
    }
}
