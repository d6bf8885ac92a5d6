//! Data models for push storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Push gateway operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Apple,
    Google,
}

impl Provider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apple => "APPLE",
            Self::Google => "GOOGLE",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }

    /// The provider a device on this platform registers with.
    pub const fn native_provider(self) -> Provider {
        match self {
            Self::Ios => Provider::Apple,
            Self::Android => Provider::Google,
        }
    }
}

/// Apple gateway environment. Not meaningful for Google.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderEnvironment {
    Sandbox,
    Production,
}

impl ProviderEnvironment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Suppressed,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Suppressed => "suppressed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One push-capable endpoint for one user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRegistration {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    /// Encrypted token, or the raw token for legacy rows.
    pub token_ciphertext: String,
    pub token_lookup_hash: Option<String>,
    pub platform: Platform,
    pub device_id: Option<String>,
    pub app_version: Option<String>,
    pub locale: Option<String>,
    pub provider_environment: Option<ProviderEnvironment>,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub disabled_at: Option<i64>,
}

impl DeviceRegistration {
    pub const fn is_active(&self) -> bool {
        self.disabled_at.is_none()
    }
}

/// A notification awaiting or having completed delivery.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxItem {
    pub id: String,
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub payload: Json<BTreeMap<String, String>>,
    pub priority: Priority,
    pub status: OutboxStatus,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
}
