//! Configuration resolution for the Citewalk push service.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON settings file (`--config <path>`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Citewalk notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub apns: ApnsConfig,
    #[serde(default)]
    pub fcm: FcmConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Database file locations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Outbox and device registration database.
    pub push_path: Option<PathBuf>,
    /// Event bus log database.
    pub bus_path: Option<PathBuf>,
}

/// Event bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Partitions given to topics created by this process.
    pub partitions: u32,
    /// Idle poll interval for consumers (milliseconds).
    pub poll_interval_ms: u64,
    /// Member heartbeat interval (milliseconds).
    pub heartbeat_interval_ms: u64,
    /// A member silent for longer than this loses its partitions (milliseconds).
    pub session_timeout_ms: u64,
    /// Records fetched per partition per poll.
    pub batch_size: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: 6,
            poll_interval_ms: 250,
            heartbeat_interval_ms: 3_000,
            session_timeout_ms: 30_000,
            batch_size: 100,
        }
    }
}

/// Delivery worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Partitions of the push topic processed concurrently.
    pub concurrency: usize,
    /// Upper bound for a single provider send (seconds).
    pub send_timeout_secs: u64,
    /// PENDING rows older than this are re-published (seconds).
    pub requeue_after_secs: u64,
    /// How often the requeue sweep runs (seconds).
    pub requeue_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            send_timeout_secs: 10,
            requeue_after_secs: 300,
            requeue_interval_secs: 60,
        }
    }
}

/// Apple push gateway credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApnsConfig {
    pub key_id: Option<String>,
    pub team_id: Option<String>,
    /// Path to the `.p8` signing key.
    pub key_path: Option<PathBuf>,
    pub bundle_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            key_id: None,
            team_id: None,
            key_path: None,
            bundle_id: None,
            request_timeout_secs: 10,
        }
    }
}

/// Google push gateway credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FcmConfig {
    /// Path to the service-account JSON key file.
    pub service_account_path: Option<PathBuf>,
    /// Pre-issued bearer token; skips the OAuth exchange when set.
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            service_account_path: None,
            access_token: None,
            request_timeout_secs: 10,
        }
    }
}

/// Token-at-rest protection.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// 64 hex characters (32 bytes). Without it tokens are stored in plaintext.
    pub field_encryption_key: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field(
                "field_encryption_key",
                &self.field_encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Load configuration: defaults, then the optional settings file, then the
/// process environment.
pub fn load_config(settings_file: Option<&Path>) -> Result<Config> {
    let mut config = match settings_file {
        Some(path) => load_config_file(path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay environment variables onto `config`.
///
/// `lookup` resolves a variable name; the binary passes `std::env::var`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("CITEWALK_FIELD_ENCRYPTION_KEY") {
        config.security.field_encryption_key = Some(val);
    }
    if let Some(val) = lookup("CITEWALK_APNS_KEY_ID") {
        config.apns.key_id = Some(val);
    }
    if let Some(val) = lookup("CITEWALK_APNS_TEAM_ID") {
        config.apns.team_id = Some(val);
    }
    if let Some(val) = lookup("CITEWALK_APNS_KEY_PATH") {
        config.apns.key_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("CITEWALK_APNS_BUNDLE_ID") {
        config.apns.bundle_id = Some(val);
    }
    if let Some(val) = lookup("CITEWALK_FCM_SERVICE_ACCOUNT") {
        config.fcm.service_account_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("CITEWALK_FCM_ACCESS_TOKEN") {
        config.fcm.access_token = Some(val);
    }
    if let Some(val) = lookup("CITEWALK_BUS_PARTITIONS")
        && let Ok(n) = val.parse()
    {
        config.bus.partitions = n;
    }
    if let Some(val) = lookup("CITEWALK_WORKER_CONCURRENCY")
        && let Ok(n) = val.parse()
    {
        config.worker.concurrency = n;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_bus_and_worker_expectations() {
        let config = Config::default();
        assert_eq!(config.bus.partitions, 6);
        assert_eq!(config.bus.session_timeout_ms, 30_000);
        assert_eq!(config.worker.concurrency, 5);
        assert!(config.security.field_encryption_key.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "bus": {{ "partitions": 12 }}, "apns": {{ "bundle_id": "com.example.app" }} }}"#
        )
        .unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.bus.partitions, 12);
        assert_eq!(config.bus.batch_size, 100);
        assert_eq!(config.apns.bundle_id.as_deref(), Some("com.example.app"));
        assert_eq!(config.apns.request_timeout_secs, 10);
        assert_eq!(config.worker.concurrency, 5);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load_config_file(Path::new("/nonexistent/citewalk.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = Config::default();
        config.apns.key_id = Some("FROMFILE".into());

        let env: HashMap<&str, &str> = [
            ("CITEWALK_APNS_KEY_ID", "FROMENV"),
            ("CITEWALK_FCM_ACCESS_TOKEN", "ya29.token"),
            ("CITEWALK_WORKER_CONCURRENCY", "9"),
            ("CITEWALK_BUS_PARTITIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.apns.key_id.as_deref(), Some("FROMENV"));
        assert_eq!(config.fcm.access_token.as_deref(), Some("ya29.token"));
        assert_eq!(config.worker.concurrency, 9);
        // Unparseable numbers leave the previous value in place.
        assert_eq!(config.bus.partitions, 6);
    }

    #[test]
    fn debug_output_redacts_encryption_key() {
        let security = SecurityConfig {
            field_encryption_key: Some("00".repeat(32)),
        };
        let rendered = format!("{security:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("0000"));
    }
}
