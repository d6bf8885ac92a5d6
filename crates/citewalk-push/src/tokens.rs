//! Token store: device registrations with token material encrypted at rest.
//!
//! Rows are found by a keyed hash of the normalized token because the
//! ciphertext is randomized per write and cannot serve as a lookup key.
//! Rows written before a key was configured hold the raw token and are found
//! by value, then upgraded in place.

use std::sync::Arc;

use citewalk_core::db::{DatabaseError, unix_timestamp_millis};
use citewalk_crypto::FieldCipher;
use tracing::{debug, info, warn};

use crate::error::PushError;
use crate::storage::{
    DeviceRegistration, NewDeviceRow, Platform, Provider, ProviderEnvironment, PushDatabase,
    RefreshDeviceRow,
};

/// A device registration submitted by a client.
#[derive(Debug, Clone)]
pub struct RegisterDevice {
    pub user_id: String,
    pub provider: Provider,
    pub token: String,
    pub platform: Platform,
    pub device_id: Option<String>,
    pub app_version: Option<String>,
    pub locale: Option<String>,
    pub environment: Option<ProviderEnvironment>,
}

/// First characters of a token, safe to log.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map_or(token.len(), |(i, _)| i);
    &token[..end]
}

#[derive(Clone)]
pub struct TokenStore {
    db: PushDatabase,
    cipher: Arc<FieldCipher>,
}

impl TokenStore {
    pub fn new(db: PushDatabase, cipher: Arc<FieldCipher>) -> Self {
        if !cipher.is_keyed() {
            warn!("No field encryption key configured; device tokens are stored in plaintext");
        }
        Self { db, cipher }
    }

    /// Create or refresh the registration for a physical token.
    ///
    /// Re-registering moves the row to `user_id`, clears `disabled_at` and
    /// advances `last_seen_at`.
    pub async fn register(&self, req: &RegisterDevice) -> Result<DeviceRegistration, PushError> {
        validate(req)?;
        let token = req.token.trim();
        let lookup_hash = self.cipher.lookup_hash(token);

        if let Some(existing) = self.find_existing(req.provider, token, &lookup_hash).await? {
            return self.refresh(&existing, req, token, &lookup_hash).await;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let ciphertext = self.cipher.encrypt(token)?;
        let inserted = self
            .db
            .insert_device(&NewDeviceRow {
                id: &id,
                user_id: &req.user_id,
                provider: req.provider,
                token_ciphertext: &ciphertext,
                token_lookup_hash: &lookup_hash,
                platform: req.platform,
                device_id: req.device_id.as_deref(),
                app_version: req.app_version.as_deref(),
                locale: req.locale.as_deref(),
                provider_environment: req.environment,
                now: unix_timestamp_millis(),
            })
            .await;

        match inserted {
            Ok(device) => {
                info!(
                    registration_id = %device.id,
                    user_id = %req.user_id,
                    provider = %req.provider,
                    token_prefix = token_prefix(token),
                    "Device registered"
                );
                Ok(device)
            }
            // Lost a race with a concurrent first registration of the same
            // token: fold into the winner's row.
            Err(DatabaseError::UniqueViolation(_)) => {
                debug!(provider = %req.provider, "Concurrent registration, refreshing winner");
                let winner = self
                    .db
                    .find_device_by_hash(req.provider, &lookup_hash)
                    .await?
                    .ok_or_else(|| {
                        DatabaseError::NotFound("registration after unique violation".into())
                    })?;
                self.refresh(&winner, req, token, &lookup_hash).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Soft-disable the registration for a token (client logout).
    ///
    /// Returns `false` if the token is unknown or already disabled.
    pub async fn unregister(&self, provider: Provider, token: &str) -> Result<bool, PushError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(PushError::Validation("token is required".into()));
        }
        let lookup_hash = self.cipher.lookup_hash(token);
        let Some(existing) = self.find_existing(provider, token, &lookup_hash).await? else {
            debug!(provider = %provider, "Unregister for unknown token");
            return Ok(false);
        };

        let disabled = self.disable(&existing.id).await?;
        if disabled {
            info!(registration_id = %existing.id, provider = %provider, "Device unregistered");
        }
        Ok(disabled)
    }

    pub async fn active_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<DeviceRegistration>, PushError> {
        Ok(self.db.active_devices_for_user(user_id).await?)
    }

    /// Decrypt the stored token of a registration.
    pub fn reveal_token(&self, device: &DeviceRegistration) -> Result<String, PushError> {
        Ok(self.cipher.decrypt(&device.token_ciphertext)?)
    }

    /// Soft-disable by id. Returns `true` if the row was active.
    pub async fn disable(&self, registration_id: &str) -> Result<bool, PushError> {
        Ok(self
            .db
            .disable_device(registration_id, unix_timestamp_millis())
            .await?)
    }

    async fn find_existing(
        &self,
        provider: Provider,
        token: &str,
        lookup_hash: &str,
    ) -> Result<Option<DeviceRegistration>, PushError> {
        if let Some(found) = self.db.find_device_by_hash(provider, lookup_hash).await? {
            return Ok(Some(found));
        }
        Ok(self.db.find_device_by_plaintext(provider, token).await?)
    }

    async fn refresh(
        &self,
        existing: &DeviceRegistration,
        req: &RegisterDevice,
        token: &str,
        lookup_hash: &str,
    ) -> Result<DeviceRegistration, PushError> {
        let upgraded = if self.cipher.is_keyed()
            && !FieldCipher::is_encrypted(&existing.token_ciphertext)
        {
            Some(self.cipher.encrypt(token)?)
        } else {
            None
        };

        // Strictly increasing even when two registrations land in the same
        // millisecond.
        let last_seen_at = unix_timestamp_millis().max(existing.last_seen_at + 1);

        let device = self
            .db
            .refresh_device(&RefreshDeviceRow {
                id: &existing.id,
                user_id: &req.user_id,
                platform: req.platform,
                device_id: req.device_id.as_deref(),
                app_version: req.app_version.as_deref(),
                locale: req.locale.as_deref(),
                provider_environment: req.environment,
                last_seen_at,
                token_lookup_hash: lookup_hash,
                token_ciphertext: upgraded.as_deref(),
            })
            .await?;

        info!(
            registration_id = %device.id,
            user_id = %req.user_id,
            provider = %req.provider,
            reactivated = existing.disabled_at.is_some(),
            reencrypted = upgraded.is_some(),
            "Device registration refreshed"
        );
        Ok(device)
    }
}

fn validate(req: &RegisterDevice) -> Result<(), PushError> {
    if req.user_id.trim().is_empty() {
        return Err(PushError::Validation("user_id is required".into()));
    }
    if req.token.trim().is_empty() {
        return Err(PushError::Validation("token is required".into()));
    }
    if req.provider == Provider::Apple && req.platform != Platform::Ios {
        return Err(PushError::Validation(
            "APPLE registrations require platform ios".into(),
        ));
    }
    if req.provider != Provider::Apple && req.environment.is_some() {
        return Err(PushError::Validation(
            "environment is only accepted for APPLE registrations".into(),
        ));
    }
    Ok(())
}
