use async_trait::async_trait;
use domain::{DeviceToken, DeviceTokenId, NotificationPreference, RepositoryError, Timestamp, UserId};

#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    /// 按令牌字符串 upsert：已存在的令牌换绑到新用户并恢复有效
    async fn register(&self, token: DeviceToken) -> Result<DeviceToken, RepositoryError>;

    /// 删除当前用户名下的令牌，返回是否存在
    async fn unregister(&self, user_id: UserId, token: &str) -> Result<bool, RepositoryError>;

    async fn list_active(&self, user_id: UserId) -> Result<Vec<DeviceToken>, RepositoryError>;

    /// 只做标记，不删除
    async fn invalidate(&self, id: DeviceTokenId, at: Timestamp) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn find(&self, user_id: UserId) -> Result<Option<NotificationPreference>, RepositoryError>;

    async fn upsert(
        &self,
        preference: NotificationPreference,
    ) -> Result<NotificationPreference, RepositoryError>;
}

pub mod memory {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    pub struct MemoryDeviceTokenRepository {
        tokens: DashMap<String, DeviceToken>,
    }

    impl MemoryDeviceTokenRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// 测试辅助：按令牌字符串读取完整记录（包括已失效的）
        pub fn get(&self, token: &str) -> Option<DeviceToken> {
            self.tokens.get(token).map(|entry| entry.value().clone())
        }
    }

    #[async_trait]
    impl DeviceTokenRepository for MemoryDeviceTokenRepository {
        async fn register(&self, token: DeviceToken) -> Result<DeviceToken, RepositoryError> {
            let mut entry = self
                .tokens
                .entry(token.token.clone())
                .or_insert_with(|| token.clone());
            entry.refresh(token.user_id, token.platform, token.last_seen_at);
            Ok(entry.value().clone())
        }

        async fn unregister(&self, user_id: UserId, token: &str) -> Result<bool, RepositoryError> {
            Ok(self
                .tokens
                .remove_if(token, |_, existing| existing.user_id == user_id)
                .is_some())
        }

        async fn list_active(&self, user_id: UserId) -> Result<Vec<DeviceToken>, RepositoryError> {
            let mut tokens: Vec<DeviceToken> = self
                .tokens
                .iter()
                .filter(|entry| entry.user_id == user_id && entry.is_active())
                .map(|entry| entry.value().clone())
                .collect();
            tokens.sort_by_key(|token| token.created_at);
            Ok(tokens)
        }

        async fn invalidate(&self, id: DeviceTokenId, at: Timestamp) -> Result<(), RepositoryError> {
            for mut entry in self.tokens.iter_mut() {
                if entry.id == id {
                    entry.invalidate(at);
                    return Ok(());
                }
            }
            Err(RepositoryError::NotFound)
        }
    }

    #[derive(Default)]
    pub struct MemoryPreferenceRepository {
        preferences: DashMap<UserId, NotificationPreference>,
    }

    impl MemoryPreferenceRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PreferenceRepository for MemoryPreferenceRepository {
        async fn find(
            &self,
            user_id: UserId,
        ) -> Result<Option<NotificationPreference>, RepositoryError> {
            Ok(self.preferences.get(&user_id).map(|entry| entry.value().clone()))
        }

        async fn upsert(
            &self,
            preference: NotificationPreference,
        ) -> Result<NotificationPreference, RepositoryError> {
            self.preferences
                .insert(preference.user_id, preference.clone());
            Ok(preference)
        }
    }
}
