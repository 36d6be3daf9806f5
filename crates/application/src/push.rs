use async_trait::async_trait;
use domain::NotificationPayload;

/// 推送服务对单个设备令牌的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// 令牌已失效，需要标记，不再重试
    InvalidToken,
    /// 超时、5xx 等可重试的失败
    TransientFailure(String),
}

/// 外部推送通道
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send(&self, token: &str, payload: &NotificationPayload) -> PushOutcome;
}
