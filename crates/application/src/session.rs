use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

/// 会话凭证校验。凭证由外部身份服务签发，这里只负责验证。
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// 校验失败返回 `ApplicationError::Authentication`
    async fn verify(&self, credential: &str) -> Result<UserId, ApplicationError>;
}
