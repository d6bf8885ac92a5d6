//! Provider senders: one delivery contract, one variant per push gateway.
//!
//! - [`ApnsSender`] for Apple, authenticated with a cached ES256 assertion
//! - [`FcmSender`] for Google, authenticated with a cached OAuth2 token
//! - [`DisabledSender`] for a variant whose configuration is missing

pub mod apns;
pub mod fcm;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::storage::{Priority, Provider, ProviderEnvironment};

pub use apns::ApnsSender;
pub use fcm::FcmSender;

/// Errors that can occur while configuring or authenticating a sender.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Failed to read or parse provider credentials.
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Signing an auth assertion failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// HTTP request to the provider failed.
    #[error("Request error: {0}")]
    Request(String),

    /// The provider returned a non-success status code.
    #[error("Provider API error (status {status}): {body}")]
    ApiError {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Response body from the provider.
        body: String,
    },
}

/// Content delivered to a single device.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
    pub priority: Priority,
}

/// Result of one send. Only `InvalidToken` justifies disabling a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The provider permanently rejected the token.
    InvalidToken { reason: String },
    /// Anything else: transport errors, timeouts, unexpected statuses.
    Failed { reason: String },
}

impl SendOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken {
            reason: reason.into(),
        }
    }
}

/// Delivers a message to one device through one provider.
///
/// Implementations are shared across concurrent sends; the only mutable
/// state they may keep is cached credentials and connections.
#[async_trait]
pub trait PushSender: Send + Sync {
    fn provider(&self) -> Provider;

    async fn send(
        &self,
        token: &str,
        message: &PushMessage,
        environment: Option<ProviderEnvironment>,
    ) -> SendOutcome;
}

/// Stand-in for a provider that is not configured. Fails every send
/// without network I/O; the reason is logged once at construction.
#[derive(Debug)]
pub struct DisabledSender {
    provider: Provider,
    reason: String,
}

impl DisabledSender {
    pub fn new(provider: Provider, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(provider = %provider, reason = %reason, "Push sender disabled");
        Self { provider, reason }
    }
}

#[async_trait]
impl PushSender for DisabledSender {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn send(
        &self,
        _token: &str,
        _message: &PushMessage,
        _environment: Option<ProviderEnvironment>,
    ) -> SendOutcome {
        SendOutcome::failed(format!("{} sender disabled: {}", self.provider, self.reason))
    }
}

/// Routes a registration's provider tag to its sender.
#[derive(Clone)]
pub struct SenderRegistry {
    apple: Arc<dyn PushSender>,
    google: Arc<dyn PushSender>,
}

impl SenderRegistry {
    pub fn new(apple: Arc<dyn PushSender>, google: Arc<dyn PushSender>) -> Self {
        Self { apple, google }
    }

    pub fn for_provider(&self, provider: Provider) -> &Arc<dyn PushSender> {
        match provider {
            Provider::Apple => &self.apple,
            Provider::Google => &self.google,
        }
    }
}

/// Build the shared HTTP client. The workspace links rustls without a
/// default provider, so ring is installed first (no-op if already set).
pub(crate) fn build_http_client(
    builder: reqwest::ClientBuilder,
) -> Result<reqwest::Client, NotificationError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    builder
        .build()
        .map_err(|e| NotificationError::Request(format!("failed to build HTTP client: {e}")))
}
