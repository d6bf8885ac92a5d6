//! Apple Push Notification service (APNs) sender.
//!
//! Talks HTTP/2 to `api.push.apple.com` (or the sandbox host) with a
//! provider authentication token: an ES256 JWT carrying the team id as
//! issuer and the signing key id in its header. Apple rejects tokens older
//! than an hour and throttles tokens refreshed more often than every 20
//! minutes, so one is minted every 50 minutes.

use std::collections::HashMap;
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

const APNS_PRODUCTION_URL: &str = "https://api.push.apple.com";
const APNS_SANDBOX_URL: &str = "https://api.sandbox.push.apple.com";

/// Age at which the provider token is re-signed (seconds).
const TOKEN_REFRESH_SECS: i64 = 50 * 60;

/// Reasons meaning the device token will never work again.
const INVALID_TOKEN_REASONS: &[&str] = &["BadDeviceToken", "Unregistered"];

/// Reasons meaning our provider token was rejected and must be re-minted.
const STALE_AUTH_REASONS: &[&str] = &["ExpiredProviderToken", "InvalidProviderToken"];

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: String,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    issued_at: i64,
}

/// APNs sender. Holds the signing key, the cached provider token and one
/// lazily built HTTP/2 client per environment.
pub struct ApnsSender {
    key_id: String,
    team_id: String,
    bundle_id: String,
    encoding_key: EncodingKey,
    request_timeout: Duration,
    production_url: String,
    sandbox_url: String,
    /// Held while signing, so concurrent callers wait for one refresh.
    token: Mutex<Option<CachedToken>>,
    /// Held while connecting, for the same reason.
    clients: Mutex<HashMap<ProviderEnvironment, reqwest::Client>>,
}

impl std::fmt::Debug for ApnsSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsSender")
            .field("key_id", &self.key_id)
            .field("team_id", &self.team_id)
            .field("bundle_id", &self.bundle_id)
            .finish_non_exhaustive()
    }
}

impl ApnsSender {
    /// Create a sender from a PEM-encoded PKCS#8 P-256 key (`.p8` contents).
    pub fn new(
        key_id: impl Into<String>,
        team_id: impl Into<String>,
        bundle_id: impl Into<String>,
        signing_key_pem: &[u8],
        request_timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let encoding_key = EncodingKey::from_ec_pem(signing_key_pem)
            .map_err(|e| NotificationError::Credentials(format!("Invalid APNs signing key: {e}")))?;

        Ok(Self {
            key_id: key_id.into(),
            team_id: team_id.into(),
            bundle_id: bundle_id.into(),
            encoding_key,
            request_timeout,
            production_url: APNS_PRODUCTION_URL.to_string(),
            sandbox_url: APNS_SANDBOX_URL.to_string(),
            token: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Create a sender by reading the signing key from a `.p8` file.
    pub fn from_key_file(
        key_id: impl Into<String>,
        team_id: impl Into<String>,
        bundle_id: impl Into<String>,
        key_path: &Path,
        request_timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let pem = std::fs::read(key_path).map_err(|e| {
            NotificationError::Credentials(format!(
                "Failed to read APNs key file {}: {e}",
                key_path.display()
            ))
        })?;
        let sender = Self::new(key_id, team_id, bundle_id, &pem, request_timeout)?;
        debug!(key_id = %sender.key_id, bundle_id = %sender.bundle_id, "APNs sender initialized");
        Ok(sender)
    }

    /// Point the sender at different gateway hosts.
    #[must_use]
    pub fn with_endpoints(
        mut self,
        production_url: impl Into<String>,
        sandbox_url: impl Into<String>,
    ) -> Self {
        self.production_url = production_url.into();
        self.sandbox_url = sandbox_url.into();
        self
    }

    fn endpoint(&self, environment: ProviderEnvironment) -> &str {
        match environment {
            ProviderEnvironment::Production => &self.production_url,
            ProviderEnvironment::Sandbox => &self.sandbox_url,
        }
    }

    /// Build the JSON body: the `aps` dictionary plus custom data at the top
    /// level. A data key named `aps` is dropped.
    pub fn build_payload(message: &PushMessage) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "aps".to_string(),
            serde_json::json!({
                "alert": { "title": message.title, "body": message.body },
                "sound": "default",
            }),
        );
        for (k, v) in &message.data {
            if k != "aps" {
                payload.insert(k.clone(), serde_json::Value::String(v.clone()));
            }
        }
        serde_json::Value::Object(payload)
    }

    async fn bearer_token(&self) -> Result<String, NotificationError> {
        self.bearer_token_at(unix_timestamp()).await
    }

    async fn bearer_token_at(&self, now: i64) -> Result<String, NotificationError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && now - token.issued_at < TOKEN_REFRESH_SECS
        {
            return Ok(token.value.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: now,
        };
        let value = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| NotificationError::Signing(e.to_string()))?;

        debug!(key_id = %self.key_id, "Minted APNs provider token");
        *cached = Some(CachedToken {
            value: value.clone(),
            issued_at: now,
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn client_for(
        &self,
        environment: ProviderEnvironment,
    ) -> Result<reqwest::Client, NotificationError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&environment) {
            return Ok(client.clone());
        }

        let client = build_http_client(
            reqwest::Client::builder()
                .http2_prior_knowledge()
                .timeout(self.request_timeout),
        )?;
        debug!(environment = environment.as_str(), "Opened APNs connection");
        clients.insert(environment, client.clone());
        Ok(client)
    }

    async fn drop_client(&self, environment: ProviderEnvironment) {
        self.clients.lock().await.remove(&environment);
    }
}

const fn apns_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "10",
        Priority::Normal => "5",
    }
}

/// Map an APNs response to an outcome.
pub fn classify_apns(status: u16, reason: Option<&str>) -> SendOutcome {
    if (200..300).contains(&status) {
        return SendOutcome::Delivered;
    }
    let reason_text = reason.unwrap_or("unknown");
    if status == 410 || reason.is_some_and(|r| INVALID_TOKEN_REASONS.contains(&r)) {
        return SendOutcome::invalid_token(format!("APNs {status}: {reason_text}"));
    }
    SendOutcome::failed(format!("APNs {status}: {reason_text}"))
}

#[async_trait]
impl PushSender for ApnsSender {
    fn provider(&self) -> Provider {
        Provider::Apple
    }

    async fn send(
        &self,
        token: &str,
        message: &PushMessage,
        environment: Option<ProviderEnvironment>,
    ) -> SendOutcome {
        let environment = environment.unwrap_or(ProviderEnvironment::Production);

        let bearer = match self.bearer_token().await {
            Ok(t) => t,
            Err(e) => return SendOutcome::failed(e.to_string()),
        };
        let client = match self.client_for(environment).await {
            Ok(c) => c,
            Err(e) => return SendOutcome::failed(e.to_string()),
        };

        let url = format!("{}/3/device/{}", self.endpoint(environment), token);
        let response = client
            .post(&url)
            .header("authorization", format!("bearer {bearer}"))
            .header("apns-topic", &self.bundle_id)
            .header("apns-push-type", "alert")
            .header("apns-priority", apns_priority(message.priority))
            .json(&Self::build_payload(message))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                // Reconnect on the next send.
                self.drop_client(environment).await;
                warn!(
                    environment = environment.as_str(),
                    token_prefix = token_prefix(token),
                    error = %e,
                    "APNs request failed"
                );
                return SendOutcome::failed(format!("APNs request error: {e}"));
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            debug!(token_prefix = token_prefix(token), "APNs notification delivered");
            return SendOutcome::Delivered;
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ApnsErrorBody>(&body)
            .ok()
            .map(|b| b.reason);

        if reason
            .as_deref()
            .is_some_and(|r| STALE_AUTH_REASONS.contains(&r))
        {
            self.invalidate_token().await;
        }

        let outcome = classify_apns(status, reason.as_deref());
        warn!(
            status,
            reason = reason.as_deref().unwrap_or(""),
            token_prefix = token_prefix(token),
            "APNs rejected notification"
        );
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use jsonwebtoken::{DecodingKey, Validation};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const DEVICE: &str = "740f4707bebcf74f";

    fn test_key() -> rcgen::KeyPair {
        rcgen::KeyPair::generate().unwrap()
    }

    fn sender_with(key: &rcgen::KeyPair) -> ApnsSender {
        ApnsSender::new(
            "KEY123ABCD",
            "TEAM987XYZ",
            "com.citewalk.app",
            key.serialize_pem().as_bytes(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn message(data: &[(&str, &str)]) -> PushMessage {
        PushMessage {
            title: "New follower".into(),
            body: "Ada followed you".into(),
            data: data
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            priority: Priority::High,
        }
    }

    #[test]
    fn payload_has_alert_sound_and_top_level_data() {
        let payload = ApnsSender::build_payload(&message(&[("userId", "u-7"), ("aps", "x")]));
        assert_eq!(
            payload,
            serde_json::json!({
                "aps": {
                    "alert": { "title": "New follower", "body": "Ada followed you" },
                    "sound": "default"
                },
                "userId": "u-7"
            })
        );
    }

    #[test]
    fn classification() {
        assert_eq!(classify_apns(200, None), SendOutcome::Delivered);
        assert!(matches!(
            classify_apns(410, Some("Unregistered")),
            SendOutcome::InvalidToken { .. }
        ));
        assert!(matches!(classify_apns(410, None), SendOutcome::InvalidToken { .. }));
        assert!(matches!(
            classify_apns(400, Some("BadDeviceToken")),
            SendOutcome::InvalidToken { .. }
        ));
        assert!(matches!(
            classify_apns(400, Some("BadTopic")),
            SendOutcome::Failed { .. }
        ));
        assert!(matches!(
            classify_apns(403, Some("ExpiredProviderToken")),
            SendOutcome::Failed { .. }
        ));
        assert!(matches!(
            classify_apns(503, Some("ServiceUnavailable")),
            SendOutcome::Failed { .. }
        ));
    }

    #[test]
    fn priority_header_values() {
        assert_eq!(apns_priority(Priority::High), "10");
        assert_eq!(apns_priority(Priority::Normal), "5");
    }

    #[tokio::test]
    async fn provider_token_is_es256_with_kid_and_team_issuer() {
        let key = test_key();
        let sender = sender_with(&key);
        let token = sender.bearer_token_at(1_700_000_000).await.unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid.as_deref(), Some("KEY123ABCD"));

        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.set_required_spec_claims::<&str>(&[]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_ec_pem(key.public_key_pem().as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims["iss"], "TEAM987XYZ");
        assert_eq!(decoded.claims["iat"], 1_700_000_000);
    }

    #[tokio::test]
    async fn provider_token_is_cached_until_refresh_age() {
        let sender = sender_with(&test_key());
        let t0 = 1_700_000_000;
        let first = sender.bearer_token_at(t0).await.unwrap();
        assert_eq!(sender.bearer_token_at(t0 + 60).await.unwrap(), first);
        assert_eq!(
            sender.bearer_token_at(t0 + TOKEN_REFRESH_SECS - 1).await.unwrap(),
            first
        );
        let refreshed = sender.bearer_token_at(t0 + TOKEN_REFRESH_SECS).await.unwrap();
        assert_ne!(refreshed, first);

        sender.invalidate_token().await;
        let reminted = sender
            .bearer_token_at(t0 + TOKEN_REFRESH_SECS + 1)
            .await
            .unwrap();
        assert_ne!(reminted, refreshed);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_token() {
        let sender = std::sync::Arc::new(sender_with(&test_key()));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let s = std::sync::Arc::clone(&sender);
                tokio::spawn(async move { s.bearer_token_at(1_700_000_000).await.unwrap() })
            })
            .collect();
        let mut tokens = std::collections::HashSet::new();
        for t in tasks {
            tokens.insert(t.await.unwrap());
        }
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn endpoints_follow_environment() {
        let sender = sender_with(&test_key());
        assert_eq!(
            sender.endpoint(ProviderEnvironment::Production),
            "https://api.push.apple.com"
        );
        assert_eq!(
            sender.endpoint(ProviderEnvironment::Sandbox),
            "https://api.sandbox.push.apple.com"
        );
    }

    #[test]
    fn rejects_invalid_key_material() {
        let err = ApnsSender::new("k", "t", "b", b"not a pem", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, NotificationError::Credentials(_)));

        let err = ApnsSender::from_key_file(
            "k",
            "t",
            "b",
            Path::new("/nonexistent/AuthKey.p8"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, NotificationError::Credentials(_)));
    }

    #[tokio::test]
    async fn transport_error_is_transient_and_drops_connection() {
        // Nothing listens on port 1.
        let sender = sender_with(&test_key())
            .with_endpoints("http://127.0.0.1:1", "http://127.0.0.1:1");
        let outcome = sender
            .send("740f4707bebcf74f", &message(&[]), Some(ProviderEnvironment::Sandbox))
            .await;
        assert!(matches!(outcome, SendOutcome::Failed { .. }), "got {outcome:?}");
        assert!(sender.clients.lock().await.is_empty());
    }

    fn gateway_sender(key: &rcgen::KeyPair, server: &MockServer) -> ApnsSender {
        // Only production is reachable, so routing mistakes fail loudly.
        sender_with(key).with_endpoints(server.uri(), "http://127.0.0.1:1")
    }

    fn authorization(request: &wiremock::Request) -> String {
        request.headers.get("authorization").unwrap().to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn delivered_request_carries_routing_and_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/3/device/{DEVICE}")))
            .and(header("apns-topic", "com.citewalk.app"))
            .and(header("apns-priority", "10"))
            .and(header("apns-push-type", "alert"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let key = test_key();
        let sender = gateway_sender(&key, &server);
        let outcome = sender.send(DEVICE, &message(&[("userId", "u-7")]), None).await;
        assert_eq!(outcome, SendOutcome::Delivered);

        let requests = server.received_requests().await.unwrap();
        let auth = authorization(&requests[0]);
        let jwt = auth.strip_prefix("bearer ").expect("bearer scheme");
        assert_eq!(jsonwebtoken::decode_header(jwt).unwrap().kid.as_deref(), Some("KEY123ABCD"));

        let body: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(body["aps"]["alert"]["title"], "New follower");
        assert_eq!(body["userId"], "u-7");
    }

    #[tokio::test]
    async fn normal_priority_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("apns-priority", "5"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut msg = message(&[]);
        msg.priority = Priority::Normal;
        let outcome = gateway_sender(&test_key(), &server)
            .send(DEVICE, &msg, Some(ProviderEnvironment::Production))
            .await;
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn unregistered_response_is_invalid_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(410)
                    .set_body_json(serde_json::json!({"reason": "Unregistered"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = gateway_sender(&test_key(), &server)
            .send(DEVICE, &message(&[]), None)
            .await;
        assert!(matches!(outcome, SendOutcome::InvalidToken { .. }), "got {outcome:?}");
    }

    #[tokio::test]
    async fn bad_device_token_body_is_invalid_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"reason": "BadDeviceToken"})),
            )
            .mount(&server)
            .await;

        let outcome = gateway_sender(&test_key(), &server)
            .send(DEVICE, &message(&[]), None)
            .await;
        assert!(matches!(outcome, SendOutcome::InvalidToken { .. }), "got {outcome:?}");
    }

    #[tokio::test]
    async fn expired_provider_token_is_reminted_on_next_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"reason": "ExpiredProviderToken"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = gateway_sender(&test_key(), &server);
        // Seed the cache with a token minted a little while ago.
        let stale = sender.bearer_token_at(unix_timestamp() - 120).await.unwrap();

        let first = sender.send(DEVICE, &message(&[]), None).await;
        assert!(matches!(first, SendOutcome::Failed { .. }), "got {first:?}");
        assert!(sender.token.lock().await.is_none());

        let second = sender.send(DEVICE, &message(&[]), None).await;
        assert_eq!(second, SendOutcome::Delivered);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(authorization(&requests[0]), format!("bearer {stale}"));
        assert_ne!(authorization(&requests[1]), authorization(&requests[0]));
    }

    #[tokio::test]
    async fn server_error_is_transient_and_keeps_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({"reason": "ServiceUnavailable"})),
            )
            .mount(&server)
            .await;

        let sender = gateway_sender(&test_key(), &server);
        let outcome = sender.send(DEVICE, &message(&[]), None).await;
        assert!(matches!(outcome, SendOutcome::Failed { .. }), "got {outcome:?}");
        assert!(sender.token.lock().await.is_some());
    }
}
