//! 实时通信核心领域模型
//!
//! 包含会话、消息、设备令牌、通知偏好等核心实体，
//! 以及实时通道上的事件定义和领域错误。

pub mod conversation;
pub mod device_token;
pub mod errors;
pub mod events;
pub mod message;
pub mod notification;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::Conversation;
pub use device_token::{DevicePlatform, DeviceToken};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use events::{ClientEvent, ServerEvent};
pub use message::{DeliveryState, DeliveryUpdate, Message, NewMessage};
pub use notification::{NotificationCategory, NotificationPayload, NotificationPreference};
pub use value_objects::{
    ConnectionId, ConversationId, DeviceTokenId, MessageContent, MessageId, Timestamp, UserId,
};
