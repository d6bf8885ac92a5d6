//! Device registration queries.

use citewalk_core::db::DatabaseError;

use super::db::PushDatabase;
use super::models::{DeviceRegistration, Platform, Provider, ProviderEnvironment};

/// Column values for a new registration.
#[derive(Debug)]
pub struct NewDeviceRow<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub provider: Provider,
    pub token_ciphertext: &'a str,
    pub token_lookup_hash: &'a str,
    pub platform: Platform,
    pub device_id: Option<&'a str>,
    pub app_version: Option<&'a str>,
    pub locale: Option<&'a str>,
    pub provider_environment: Option<ProviderEnvironment>,
    pub now: i64,
}

/// Column values applied when an existing registration is seen again.
#[derive(Debug)]
pub struct RefreshDeviceRow<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub platform: Platform,
    pub device_id: Option<&'a str>,
    pub app_version: Option<&'a str>,
    pub locale: Option<&'a str>,
    pub provider_environment: Option<ProviderEnvironment>,
    pub last_seen_at: i64,
    pub token_lookup_hash: &'a str,
    /// Replacement ciphertext for legacy plaintext rows.
    pub token_ciphertext: Option<&'a str>,
}

impl PushDatabase {
    // =========================================================================
    // Device registration queries
    // =========================================================================

    /// Insert a registration. Fails with `UniqueViolation` if the
    /// (provider, lookup hash) pair is already taken.
    pub async fn insert_device(
        &self,
        row: &NewDeviceRow<'_>,
    ) -> Result<DeviceRegistration, DatabaseError> {
        let device = sqlx::query_as::<_, DeviceRegistration>(
            "INSERT INTO device_registrations \
             (id, user_id, provider, token_ciphertext, token_lookup_hash, platform, \
              device_id, app_version, locale, provider_environment, created_at, last_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING *",
        )
        .bind(row.id)
        .bind(row.user_id)
        .bind(row.provider)
        .bind(row.token_ciphertext)
        .bind(row.token_lookup_hash)
        .bind(row.platform)
        .bind(row.device_id)
        .bind(row.app_version)
        .bind(row.locale)
        .bind(row.provider_environment)
        .bind(row.now)
        .bind(row.now)
        .fetch_one(self.pool())
        .await?;

        Ok(device)
    }

    /// Reassign, reactivate and touch an existing registration.
    ///
    /// Optional metadata left as `None` keeps the stored value.
    pub async fn refresh_device(
        &self,
        row: &RefreshDeviceRow<'_>,
    ) -> Result<DeviceRegistration, DatabaseError> {
        let device = sqlx::query_as::<_, DeviceRegistration>(
            "UPDATE device_registrations SET \
             user_id = ?, platform = ?, \
             device_id = COALESCE(?, device_id), \
             app_version = COALESCE(?, app_version), \
             locale = COALESCE(?, locale), \
             provider_environment = COALESCE(?, provider_environment), \
             last_seen_at = ?, disabled_at = NULL, \
             token_lookup_hash = ?, \
             token_ciphertext = COALESCE(?, token_ciphertext) \
             WHERE id = ? \
             RETURNING *",
        )
        .bind(row.user_id)
        .bind(row.platform)
        .bind(row.device_id)
        .bind(row.app_version)
        .bind(row.locale)
        .bind(row.provider_environment)
        .bind(row.last_seen_at)
        .bind(row.token_lookup_hash)
        .bind(row.token_ciphertext)
        .bind(row.id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("device registration {}", row.id)))?;

        Ok(device)
    }

    pub async fn find_device_by_hash(
        &self,
        provider: Provider,
        lookup_hash: &str,
    ) -> Result<Option<DeviceRegistration>, DatabaseError> {
        let device = sqlx::query_as::<_, DeviceRegistration>(
            "SELECT * FROM device_registrations WHERE provider = ? AND token_lookup_hash = ?",
        )
        .bind(provider)
        .bind(lookup_hash)
        .fetch_optional(self.pool())
        .await?;

        Ok(device)
    }

    /// Find a row whose stored token is the raw value, i.e. one written
    /// before encryption was configured.
    pub async fn find_device_by_plaintext(
        &self,
        provider: Provider,
        token: &str,
    ) -> Result<Option<DeviceRegistration>, DatabaseError> {
        let device = sqlx::query_as::<_, DeviceRegistration>(
            "SELECT * FROM device_registrations \
             WHERE provider = ? AND token_ciphertext = ? \
             ORDER BY last_seen_at DESC LIMIT 1",
        )
        .bind(provider)
        .bind(token)
        .fetch_optional(self.pool())
        .await?;

        Ok(device)
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<DeviceRegistration>, DatabaseError> {
        let device =
            sqlx::query_as::<_, DeviceRegistration>("SELECT * FROM device_registrations WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        Ok(device)
    }

    /// Active registrations for a user, most recently seen first.
    pub async fn active_devices_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<DeviceRegistration>, DatabaseError> {
        let devices = sqlx::query_as::<_, DeviceRegistration>(
            "SELECT * FROM device_registrations \
             WHERE user_id = ? AND disabled_at IS NULL \
             ORDER BY last_seen_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        Ok(devices)
    }

    /// Soft-disable a registration.
    ///
    /// Returns `true` if the row was active before the call.
    pub async fn disable_device(&self, id: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE device_registrations SET disabled_at = ? WHERE id = ? AND disabled_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
