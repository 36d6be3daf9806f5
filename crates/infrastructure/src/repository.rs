use std::time::Duration;

use application::{DeviceTokenRepository, PreferenceRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    DevicePlatform, DeviceToken, DeviceTokenId, NotificationPreference, RepositoryError,
    Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use crate::message_store::PgMessageStore;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict;
        }
    }
    RepositoryError::storage(err.to_string())
}

pub(crate) fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct DeviceTokenRecord {
    id: Uuid,
    user_id: Uuid,
    token: String,
    platform: String,
    last_seen_at: DateTime<Utc>,
    invalidated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeviceTokenRecord> for DeviceToken {
    type Error = RepositoryError;

    fn try_from(value: DeviceTokenRecord) -> Result<Self, Self::Error> {
        let platform = value
            .platform
            .parse::<DevicePlatform>()
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(DeviceToken {
            id: DeviceTokenId::from(value.id),
            user_id: UserId::from(value.user_id),
            token: value.token,
            platform,
            last_seen_at: value.last_seen_at,
            invalidated_at: value.invalidated_at,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PreferenceRecord {
    user_id: Uuid,
    message: bool,
    alert: bool,
    event: bool,
    help_request: bool,
    updated_at: DateTime<Utc>,
}

impl From<PreferenceRecord> for NotificationPreference {
    fn from(value: PreferenceRecord) -> Self {
        NotificationPreference {
            user_id: UserId::from(value.user_id),
            message: value.message,
            alert: value.alert,
            event: value.event,
            help_request: value.help_request,
            updated_at: value.updated_at,
        }
    }
}

const DEVICE_TOKEN_COLUMNS: &str =
    "id, user_id, token, platform, last_seen_at, invalidated_at, created_at";

#[derive(Clone)]
pub struct PgDeviceTokenRepository {
    pool: PgPool,
}

impl PgDeviceTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceTokenRepository for PgDeviceTokenRepository {
    /// 同一令牌字符串再次注册时改绑到新用户并恢复有效
    async fn register(&self, token: DeviceToken) -> Result<DeviceToken, RepositoryError> {
        let record = sqlx::query_as::<_, DeviceTokenRecord>(&format!(
            r#"
            INSERT INTO device_tokens (id, user_id, token, platform, last_seen_at, invalidated_at, created_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6)
            ON CONFLICT (token) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                platform = EXCLUDED.platform,
                last_seen_at = EXCLUDED.last_seen_at,
                invalidated_at = NULL
            RETURNING {DEVICE_TOKEN_COLUMNS}
            "#
        ))
        .bind(Uuid::from(token.id))
        .bind(Uuid::from(token.user_id))
        .bind(&token.token)
        .bind(token.platform.as_str())
        .bind(token.last_seen_at)
        .bind(token.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        DeviceToken::try_from(record)
    }

    async fn unregister(&self, user_id: UserId, token: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE user_id = $1 AND token = $2")
            .bind(Uuid::from(user_id))
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, user_id: UserId) -> Result<Vec<DeviceToken>, RepositoryError> {
        let records = sqlx::query_as::<_, DeviceTokenRecord>(&format!(
            r#"
            SELECT {DEVICE_TOKEN_COLUMNS}
            FROM device_tokens
            WHERE user_id = $1 AND invalidated_at IS NULL
            ORDER BY created_at
            "#
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(DeviceToken::try_from).collect()
    }

    async fn invalidate(&self, id: DeviceTokenId, at: Timestamp) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE device_tokens SET invalidated_at = COALESCE(invalidated_at, $2) WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgPreferenceRepository {
    pool: PgPool,
}

impl PgPreferenceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceRepository for PgPreferenceRepository {
    async fn find(&self, user_id: UserId) -> Result<Option<NotificationPreference>, RepositoryError> {
        let record = sqlx::query_as::<_, PreferenceRecord>(
            r#"
            SELECT user_id, message, alert, event, help_request, updated_at
            FROM notification_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(NotificationPreference::from))
    }

    async fn upsert(
        &self,
        preference: NotificationPreference,
    ) -> Result<NotificationPreference, RepositoryError> {
        let record = sqlx::query_as::<_, PreferenceRecord>(
            r#"
            INSERT INTO notification_preferences (user_id, message, alert, event, help_request, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET message = EXCLUDED.message,
                alert = EXCLUDED.alert,
                event = EXCLUDED.event,
                help_request = EXCLUDED.help_request,
                updated_at = EXCLUDED.updated_at
            RETURNING user_id, message, alert, event, help_request, updated_at
            "#,
        )
        .bind(Uuid::from(preference.user_id))
        .bind(preference.message)
        .bind(preference.alert)
        .bind(preference.event)
        .bind(preference.help_request)
        .bind(preference.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }
}

/// 基于同一个连接池的全部 PostgreSQL 仓储
#[derive(Clone)]
pub struct PgStorage {
    pub message_store: PgMessageStore,
    pub device_tokens: PgDeviceTokenRepository,
    pub preferences: PgPreferenceRepository,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            message_store: PgMessageStore::new(pool.clone()),
            device_tokens: PgDeviceTokenRepository::new(pool.clone()),
            preferences: PgPreferenceRepository::new(pool),
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}
