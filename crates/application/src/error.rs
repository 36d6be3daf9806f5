use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    /// 凭证无效或过期，连接被拒绝
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// 对非成员会话的操作
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        ApplicationError::Authorization(message.into())
    }

    /// 对外暴露的稳定错误码（HTTP 响应体与实时通道 `error` 事件共用）
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Domain(DomainError::InvalidArgument { .. }) => "validation_error",
            ApplicationError::Domain(DomainError::ConversationNotFound)
            | ApplicationError::Domain(DomainError::MessageNotFound)
            | ApplicationError::Repository(RepositoryError::NotFound) => "not_found",
            ApplicationError::Domain(DomainError::NotAParticipant)
            | ApplicationError::Authorization(_) => "authorization_error",
            ApplicationError::Domain(DomainError::ConversationArchived)
            | ApplicationError::Domain(DomainError::NotAGroup)
            | ApplicationError::Repository(RepositoryError::Conflict) => "conflict",
            ApplicationError::Authentication(_) => "auth_error",
            ApplicationError::Repository(RepositoryError::Storage { .. })
            | ApplicationError::Infrastructure(_) => "internal_error",
        }
    }
}
