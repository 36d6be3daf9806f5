use std::sync::Arc;

use application::{DeviceTokenRepository, MessageStore, PreferenceRepository, PushProvider};
use config::{DatabaseConfig, NotificationConfig};
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    push::HttpPushProvider,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("push client error: {0}")]
    PushClient(#[from] reqwest::Error),
}

/// 连接数据库、执行迁移并构建全部外部适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub push: Arc<HttpPushProvider>,
}

impl Infrastructure {
    pub async fn connect(
        database: &DatabaseConfig,
        notifications: &NotificationConfig,
    ) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(
            &database.url,
            database.max_connections,
            database.acquire_timeout(),
        )
        .await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("database migrations applied");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
            push: Arc::new(HttpPushProvider::from_config(notifications)?),
        })
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::new(self.storage.message_store.clone())
    }

    pub fn device_tokens(&self) -> Arc<dyn DeviceTokenRepository> {
        Arc::new(self.storage.device_tokens.clone())
    }

    pub fn preferences(&self) -> Arc<dyn PreferenceRepository> {
        Arc::new(self.storage.preferences.clone())
    }

    pub fn push_provider(&self) -> Arc<dyn PushProvider> {
        self.push.clone()
    }
}
