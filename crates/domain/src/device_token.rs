use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{DeviceTokenId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlatform {
    Ios,
    Android,
    Web,
}

impl DevicePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePlatform::Ios => "ios",
            DevicePlatform::Android => "android",
            DevicePlatform::Web => "web",
        }
    }
}

impl fmt::Display for DevicePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevicePlatform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(DevicePlatform::Ios),
            "android" => Ok(DevicePlatform::Android),
            "web" => Ok(DevicePlatform::Web),
            other => Err(DomainError::invalid_argument(
                "platform",
                format!("unknown platform `{other}`"),
            )),
        }
    }
}

/// 设备推送令牌。
///
/// 推送服务报告令牌失效时只做标记（`invalidated_at`），不删除记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: DeviceTokenId,
    pub user_id: UserId,
    pub token: String,
    pub platform: DevicePlatform,
    pub last_seen_at: Timestamp,
    pub invalidated_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl DeviceToken {
    pub fn register(
        user_id: UserId,
        token: impl Into<String>,
        platform: DevicePlatform,
        at: Timestamp,
    ) -> Result<Self, DomainError> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(DomainError::invalid_argument("token", "cannot be empty"));
        }
        if token.len() > 512 {
            return Err(DomainError::invalid_argument("token", "too long"));
        }
        Ok(Self {
            id: DeviceTokenId::random(),
            user_id,
            token: token.to_owned(),
            platform,
            last_seen_at: at,
            invalidated_at: None,
            created_at: at,
        })
    }

    pub fn is_active(&self) -> bool {
        self.invalidated_at.is_none()
    }

    /// 同一令牌再次注册：换绑到新用户、刷新活跃时间并恢复有效
    pub fn refresh(&mut self, user_id: UserId, platform: DevicePlatform, at: Timestamp) {
        self.user_id = user_id;
        self.platform = platform;
        self.last_seen_at = at;
        self.invalidated_at = None;
    }

    pub fn invalidate(&mut self, at: Timestamp) {
        if self.invalidated_at.is_none() {
            self.invalidated_at = Some(at);
        }
    }
}
