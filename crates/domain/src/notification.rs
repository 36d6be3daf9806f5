use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MessageId, Timestamp, UserId};

/// 推送通知类别，每个类别可以由用户单独关闭
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Message,
    Alert,
    Event,
    HelpRequest,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Message => "message",
            NotificationCategory::Alert => "alert",
            NotificationCategory::Event => "event",
            NotificationCategory::HelpRequest => "help_request",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "alert" => Ok(Self::Alert),
            "event" => Ok(Self::Event),
            "help_request" => Ok(Self::HelpRequest),
            other => Err(DomainError::invalid_argument(
                "category",
                format!("unknown category `{other}`"),
            )),
        }
    }
}

/// 用户的通知偏好。没有记录时等同于全部开启。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: UserId,
    pub message: bool,
    pub alert: bool,
    pub event: bool,
    pub help_request: bool,
    pub updated_at: Timestamp,
}

impl NotificationPreference {
    pub fn all_enabled(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            message: true,
            alert: true,
            event: true,
            help_request: true,
            updated_at: at,
        }
    }

    pub fn allows(&self, category: NotificationCategory) -> bool {
        match category {
            NotificationCategory::Message => self.message,
            NotificationCategory::Alert => self.alert,
            NotificationCategory::Event => self.event,
            NotificationCategory::HelpRequest => self.help_request,
        }
    }
}

/// 推送给设备的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// 关联消息。存在时，投递前会检查该消息是否已被实时送达。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: serde_json::Value::Null,
            message_id: None,
        }
    }

    pub fn for_message(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
