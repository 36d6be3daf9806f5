//! 实时通道上的事件
//!
//! 帧格式为 `{"type": "...", "data": {...}}`，类型名使用 snake_case。
//! 客户端事件是封闭枚举，由网关穷举处理。

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::value_objects::{ConversationId, MessageId, UserId};

/// 客户端 -> 服务端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        /// 客户端自带的关联标识，原样回传到 `message_accepted`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MarkRead {
        message_id: MessageId,
    },
    /// 显式送达确认（可选，幂等）
    AckDelivered {
        message_id: MessageId,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::JoinConversation { .. } => "join_conversation",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::MarkRead { .. } => "mark_read",
            ClientEvent::AckDelivered { .. } => "ack_delivered",
        }
    }
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready {
        user_id: UserId,
        conversation_ids: Vec<ConversationId>,
    },
    NewMessage {
        message: Message,
    },
    MessageAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        message: Message,
    },
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageReadBy {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
