//! FCM HTTP v1 API sender.
//!
//! Constructs and sends push notification requests to the Firebase Cloud
//! Messaging HTTP v1 API endpoint. Requests are authorized with an OAuth2
//! access token obtained by exchanging a service-account-signed JWT, or
//! with a static token supplied through configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use citewalk_core::db::unix_timestamp;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{NotificationError, PushMessage, PushSender, SendOutcome, build_http_client};
use crate::storage::{Priority, Provider, ProviderEnvironment};
use crate::tokens::token_prefix;

/// FCM HTTP v1 API endpoint template.
/// The `{project_id}` placeholder is replaced with the actual project ID.
const FCM_API_URL_TEMPLATE: &str =
    "https://fcm.googleapis.com/v1/projects/{project_id}/messages:send";

const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer";

/// Lifetime requested for the signed assertion (seconds).
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Access tokens are treated as expired this long before Google says so.
const ACCESS_TOKEN_SKEW_SECS: i64 = 60;

/// FCM error codes meaning the registration token is dead.
const INVALID_TOKEN_CODES: &[&str] = &["UNREGISTERED", "INVALID_ARGUMENT"];

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// Service account credentials loaded from a Google Cloud JSON key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountCredentials {
    /// The Google Cloud project ID.
    pub project_id: String,

    /// Issuer of the OAuth2 assertion.
    #[serde(default)]
    pub client_email: String,

    /// RSA private key in PEM format.
    #[serde(default)]
    pub private_key: String,

    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountCredentials")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"[REDACTED]")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// FCM notification message payload.
#[derive(Debug, Serialize)]
pub struct FcmMessage {
    /// The wrapper message object required by the FCM v1 API.
    pub message: FcmMessageBody,
}

/// The inner message body sent to FCM.
#[derive(Debug, Serialize)]
pub struct FcmMessageBody {
    /// The device registration token to send the notification to.
    pub token: String,

    pub notification: FcmNotification,

    /// Custom key-value string pairs.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    pub android: FcmAndroidConfig,
}

/// FCM notification display payload.
#[derive(Debug, Serialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct FcmAndroidConfig {
    /// `HIGH` or `NORMAL`.
    pub priority: &'static str,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug)]
struct CachedAccessToken {
    value: String,
    expires_at: i64,
}

enum FcmAuth {
    /// Pre-issued token from configuration; never refreshed.
    Static(String),
    /// Service account JWT exchanged for short-lived access tokens.
    ServiceAccount {
        encoding_key: EncodingKey,
        cached: Mutex<Option<CachedAccessToken>>,
    },
}

/// Sender for the FCM HTTP v1 API.
///
/// Holds the HTTP client, service account credentials, and the resolved API
/// endpoint URL.
pub struct FcmSender {
    http: reqwest::Client,
    credentials: ServiceAccountCredentials,
    api_url: String,
    auth: FcmAuth,
}

impl std::fmt::Debug for FcmSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmSender")
            .field("project_id", &self.credentials.project_id)
            .field("api_url", &self.api_url)
            .field("static_token", &matches!(self.auth, FcmAuth::Static(_)))
            .finish_non_exhaustive()
    }
}

impl FcmSender {
    /// Create a sender by loading service account credentials from a JSON
    /// file.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::Credentials` if the file cannot be read or
    /// parsed, or if no usable credential is available.
    pub fn from_credentials_file(
        path: &Path,
        access_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NotificationError::Credentials(format!(
                "Failed to read credentials file {}: {e}",
                path.display()
            ))
        })?;

        let credentials: ServiceAccountCredentials =
            serde_json::from_str(&content).map_err(|e| {
                NotificationError::Credentials(format!("Failed to parse credentials JSON: {e}"))
            })?;

        Self::from_credentials(credentials, access_token, request_timeout)
    }

    /// Create a sender from pre-parsed credentials.
    ///
    /// A non-empty `access_token` is used as-is; otherwise the credentials'
    /// private key must be a valid RSA PEM.
    pub fn from_credentials(
        credentials: ServiceAccountCredentials,
        access_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let auth = match access_token.filter(|t| !t.trim().is_empty()) {
            Some(token) => FcmAuth::Static(token),
            None => {
                if credentials.client_email.is_empty() {
                    return Err(NotificationError::Credentials(
                        "service account client_email is missing".to_string(),
                    ));
                }
                let encoding_key = EncodingKey::from_rsa_pem(credentials.private_key.as_bytes())
                    .map_err(|e| {
                        NotificationError::Credentials(format!(
                            "Invalid service account private key: {e}"
                        ))
                    })?;
                FcmAuth::ServiceAccount {
                    encoding_key,
                    cached: Mutex::new(None),
                }
            }
        };

        let http = build_http_client(reqwest::Client::builder().timeout(request_timeout))?;
        let api_url = FCM_API_URL_TEMPLATE.replace("{project_id}", &credentials.project_id);

        debug!(
            project_id = %credentials.project_id,
            static_token = matches!(auth, FcmAuth::Static(_)),
            "FCM sender initialized"
        );

        Ok(Self {
            http,
            credentials,
            api_url,
            auth,
        })
    }

    /// Create a sender with a static token for testing purposes only.
    #[cfg(test)]
    #[allow(clippy::expect_used)]
    pub(crate) fn for_testing(credentials: ServiceAccountCredentials) -> Self {
        Self::from_credentials(
            credentials,
            Some("test-access-token".to_string()),
            Duration::from_secs(2),
        )
        .expect("failed to build test FCM sender")
    }

    /// Override the messages endpoint.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Build an [`FcmMessage`] for the given device token.
    pub fn build_message(device_token: &str, message: &PushMessage) -> FcmMessage {
        FcmMessage {
            message: FcmMessageBody {
                token: device_token.to_string(),
                notification: FcmNotification {
                    title: message.title.clone(),
                    body: message.body.clone(),
                },
                data: message.data.clone(),
                android: FcmAndroidConfig {
                    priority: match message.priority {
                        Priority::High => "HIGH",
                        Priority::Normal => "NORMAL",
                    },
                },
            },
        }
    }

    /// Returns the project ID from the loaded credentials.
    pub fn project_id(&self) -> &str {
        &self.credentials.project_id
    }

    /// Returns the resolved FCM API URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn access_token(&self) -> Result<String, NotificationError> {
        match &self.auth {
            FcmAuth::Static(token) => Ok(token.clone()),
            FcmAuth::ServiceAccount {
                encoding_key,
                cached,
            } => {
                let mut cached = cached.lock().await;
                let now = unix_timestamp();
                if let Some(token) = cached.as_ref()
                    && now < token.expires_at
                {
                    return Ok(token.value.clone());
                }

                let fresh = self.exchange_assertion(encoding_key, now).await?;
                let value = fresh.value.clone();
                *cached = Some(fresh);
                Ok(value)
            }
        }
    }

    async fn exchange_assertion(
        &self,
        encoding_key: &EncodingKey,
        now: i64,
    ) -> Result<CachedAccessToken, NotificationError> {
        let claims = AssertionClaims {
            iss: &self.credentials.client_email,
            scope: FCM_SCOPE,
            aud: &self.credentials.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, encoding_key)
            .map_err(|e| NotificationError::Signing(e.to_string()))?;

        // JWTs are base64url plus dots, so only the grant type needs escaping.
        let form = format!("grant_type={JWT_BEARER_GRANT}&assertion={assertion}");
        let response = self
            .http
            .post(&self.credentials.token_uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await
            .map_err(|e| NotificationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(NotificationError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| NotificationError::Request(format!("invalid token response: {e}")))?;
        let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);

        debug!(project_id = %self.credentials.project_id, lifetime, "Obtained FCM access token");
        Ok(CachedAccessToken {
            value: token.access_token,
            expires_at: now + lifetime - ACCESS_TOKEN_SKEW_SECS,
        })
    }

    async fn invalidate_access_token(&self) {
        if let FcmAuth::ServiceAccount { cached, .. } = &self.auth {
            *cached.lock().await = None;
        }
    }
}

/// Map an FCM response to an outcome.
///
/// The v1 API reports dead tokens either through an `FcmError` detail's
/// `errorCode` or through the top-level `error.status`.
pub fn classify_fcm(status: u16, body: &str) -> SendOutcome {
    if (200..300).contains(&status) {
        return SendOutcome::Delivered;
    }

    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let error = &parsed["error"];
    let detail_code = error["details"].as_array().and_then(|details| {
        details
            .iter()
            .find_map(|d| d["errorCode"].as_str())
    });
    let error_status = error["status"].as_str();

    let dead = detail_code.is_some_and(|c| INVALID_TOKEN_CODES.contains(&c))
        || error_status == Some("INVALID_ARGUMENT");

    let code = detail_code.or(error_status).unwrap_or("unknown");
    if dead {
        SendOutcome::invalid_token(format!("FCM {status}: {code}"))
    } else {
        SendOutcome::failed(format!("FCM {status}: {code}"))
    }
}

#[async_trait]
impl PushSender for FcmSender {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn send(
        &self,
        token: &str,
        message: &PushMessage,
        _environment: Option<ProviderEnvironment>,
    ) -> SendOutcome {
        let access_token = match self.access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Failed to obtain FCM access token");
                return SendOutcome::failed(e.to_string());
            }
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&Self::build_message(token, message))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(token_prefix = token_prefix(token), error = %e, "FCM request failed");
                return SendOutcome::failed(format!("FCM request error: {e}"));
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            debug!(token_prefix = token_prefix(token), "FCM notification sent successfully");
            return SendOutcome::Delivered;
        }

        if status == 401 {
            self.invalidate_access_token().await;
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        warn!(status, body = %body, token_prefix = token_prefix(token), "FCM API returned error");
        classify_fcm(status, &body)
    }
}
