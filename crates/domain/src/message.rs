use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, MessageContent, MessageId, Timestamp, UserId};

/// 接收者维度的投递状态。
///
/// 状态只会前进：`Sent -> Delivered -> Read`，`Read` 隐含 `Delivered`。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// 推进到 `target`，返回推进后的状态以及是否发生变化
    pub fn advance(self, target: DeliveryState) -> (DeliveryState, bool) {
        if target > self {
            (target, true)
        } else {
            (self, false)
        }
    }

    pub fn is_delivered(self) -> bool {
        self >= DeliveryState::Delivered
    }

    pub fn as_i16(self) -> i16 {
        match self {
            DeliveryState::Sent => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Read => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(DeliveryState::Sent),
            1 => Some(DeliveryState::Delivered),
            2 => Some(DeliveryState::Read),
            _ => None,
        }
    }
}

/// 状态更新结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    pub state: DeliveryState,
    pub changed: bool,
}

/// 尚未分配序号的待追加消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
}

impl NewMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::random(),
            conversation_id,
            sender_id,
            content,
            created_at,
        }
    }

    /// 由消息存储在分配序号后调用
    pub fn into_message(
        self,
        sequence: u64,
        recipients: impl IntoIterator<Item = UserId>,
    ) -> Message {
        let delivery = recipients
            .into_iter()
            .filter(|id| *id != self.sender_id)
            .map(|id| (id, DeliveryState::Sent))
            .collect();
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            sequence,
            created_at: self.created_at,
            delivery,
        }
    }
}

/// 已持久化的消息。除投递状态外不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub sequence: u64,
    pub created_at: Timestamp,
    pub delivery: BTreeMap<UserId, DeliveryState>,
}

impl Message {
    pub fn delivery_state(&self, user_id: UserId) -> Option<DeliveryState> {
        self.delivery.get(&user_id).copied()
    }

    /// 推进某个接收者的状态。非接收者（包括发送者）返回 `None`。
    pub fn advance(&mut self, user_id: UserId, target: DeliveryState) -> Option<DeliveryUpdate> {
        let current = self.delivery.get_mut(&user_id)?;
        let (state, changed) = current.advance(target);
        *current = state;
        Some(DeliveryUpdate { state, changed })
    }
}
