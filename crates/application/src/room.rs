//! 会话房间：实时扇出
//!
//! 维护进程内的连接登记表（每条连接一个有界出站队列）以及
//! 会话 -> 连接 的房间成员关系。推送一律使用 `try_send`，
//! 慢连接或已关闭的连接会被移出实时投递，由通知路径兜底。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use domain::{
    ConnectionId, Conversation, ConversationId, Message, MessageId, NotificationCategory,
    NotificationPayload, ServerEvent, UserId,
};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::message_store::MessageStore;
use crate::notification::{EnqueueOutcome, NotificationDispatcher};
use crate::presence::PresenceTracker;

/// 推送通知正文中的消息预览长度
const PUSH_PREVIEW_CHARS: usize = 120;

struct LiveConnection {
    user_id: UserId,
    /// 被判定为慢连接后置空，接收端随之结束
    sender: Option<mpsc::Sender<ServerEvent>>,
    rooms: HashSet<ConversationId>,
}

/// `broadcast_message` 的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// 至少一条连接接收了事件的接收者
    pub delivered_live: Vec<UserId>,
    /// 转入推送通知的接收者
    pub queued_for_push: Vec<UserId>,
    /// 因队列满或已关闭而被移出实时投递的连接数
    pub dropped_connections: usize,
}

pub struct ConversationRooms {
    presence: Arc<PresenceTracker>,
    store: Arc<dyn MessageStore>,
    notifications: NotificationDispatcher,
    connections: DashMap<ConnectionId, LiveConnection>,
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
}

impl ConversationRooms {
    pub fn new(
        presence: Arc<PresenceTracker>,
        store: Arc<dyn MessageStore>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            presence,
            store,
            notifications,
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    pub fn bind_connection(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        sender: mpsc::Sender<ServerEvent>,
    ) {
        self.connections.insert(
            connection_id,
            LiveConnection {
                user_id,
                sender: Some(sender),
                rooms: HashSet::new(),
            },
        );
    }

    /// 解除连接并退出所有房间，返回连接所属用户与曾加入的会话
    pub fn unbind_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Option<(UserId, Vec<ConversationId>)> {
        let (_, connection) = self.connections.remove(&connection_id)?;
        for conversation_id in &connection.rooms {
            self.rooms.remove_if_mut(conversation_id, |_, members| {
                members.remove(&connection_id);
                members.is_empty()
            });
        }
        Some((connection.user_id, connection.rooms.into_iter().collect()))
    }

    pub fn connection_user(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections
            .get(&connection_id)
            .map(|connection| connection.user_id)
    }

    pub fn join(&self, conversation_id: ConversationId, connection_id: ConnectionId) -> bool {
        let joined = match self.connections.get_mut(&connection_id) {
            Some(mut connection) => connection.rooms.insert(conversation_id),
            None => return false,
        };
        self.rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        joined
    }

    pub fn leave(&self, conversation_id: ConversationId, connection_id: ConnectionId) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.rooms.remove(&conversation_id);
        }
        self.rooms.remove_if_mut(&conversation_id, |_, members| {
            members.remove(&connection_id);
            members.is_empty()
        });
    }

    /// 把用户当前所有连接加入房间（新建会话、新增成员时使用）
    pub fn join_user(&self, conversation_id: ConversationId, user_id: UserId) {
        for connection_id in self.presence.connections_for(user_id) {
            self.join(conversation_id, connection_id);
        }
    }

    pub fn leave_user(&self, conversation_id: ConversationId, user_id: UserId) {
        for connection_id in self.presence.connections_for(user_id) {
            self.leave(conversation_id, connection_id);
        }
    }

    pub fn room_members(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        self.rooms
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 向单条连接推送，不等待。失败的连接会被移出实时投递。
    pub fn push(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let sender = match self.connections.get(&connection_id) {
            Some(connection) => connection.sender.clone(),
            None => return false,
        };
        let Some(sender) = sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    "outbound queue full, dropping slow connection from live delivery"
                );
                self.evict(connection_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %connection_id, "outbound queue closed");
                self.evict(connection_id);
                false
            }
        }
    }

    /// 向会话所有成员扇出新消息。
    ///
    /// 成员的每一条存活连接都会收到（包括发送者的其他设备），`origin`
    /// 连接除外。接收者只要有一条连接接收了事件即标记为已送达，否则转入推送通知。
    pub async fn broadcast_message(
        &self,
        conversation: &Conversation,
        message: &Message,
        origin: Option<ConnectionId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };

        for participant in conversation.participants.iter().copied() {
            let mut accepted = 0;
            for connection_id in self.presence.connections_for(participant) {
                if Some(connection_id) == origin {
                    continue;
                }
                if self.push(connection_id, event.clone()) {
                    accepted += 1;
                } else {
                    report.dropped_connections += 1;
                }
            }

            if participant == message.sender_id || message.delivery_state(participant).is_none() {
                continue;
            }

            if accepted > 0 {
                if let Err(err) = self.store.mark_delivered(message.id, participant).await {
                    tracing::warn!(
                        message_id = %message.id,
                        user_id = %participant,
                        error = %err,
                        "failed to mark message delivered"
                    );
                }
                report.delivered_live.push(participant);
            } else {
                let payload = push_payload(conversation, message);
                let outcome = self
                    .notifications
                    .enqueue(participant, payload, NotificationCategory::Message)
                    .await;
                if outcome == EnqueueOutcome::Scheduled {
                    report.queued_for_push.push(participant);
                }
            }
        }

        tracing::debug!(
            conversation_id = %conversation.id,
            sequence = message.sequence,
            delivered_live = report.delivered_live.len(),
            queued_for_push = report.queued_for_push.len(),
            "message broadcast"
        );
        report
    }

    /// 输入状态只推给在线成员，不排队，不推给输入者自己
    pub fn broadcast_typing(&self, conversation_id: ConversationId, user_id: UserId, started: bool) {
        let event = if started {
            ServerEvent::TypingStart {
                conversation_id,
                user_id,
            }
        } else {
            ServerEvent::TypingStop {
                conversation_id,
                user_id,
            }
        };
        self.fan_out(self.room_members(conversation_id), Some(user_id), &event);
    }

    pub fn broadcast_read_receipt(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
    ) {
        let event = ServerEvent::MessageReadBy {
            conversation_id,
            message_id,
            user_id: reader_id,
        };
        self.fan_out(self.room_members(conversation_id), None, &event);
    }

    /// 通知用户所在各会话的成员，每条连接只收到一次
    pub fn broadcast_presence(&self, user_id: UserId, online: bool, conversations: &[ConversationId]) {
        let mut targets = HashSet::new();
        for conversation_id in conversations {
            targets.extend(self.room_members(*conversation_id));
        }
        let event = ServerEvent::PresenceChanged { user_id, online };
        self.fan_out(targets, Some(user_id), &event);
    }

    fn fan_out(
        &self,
        targets: impl IntoIterator<Item = ConnectionId>,
        exclude_user: Option<UserId>,
        event: &ServerEvent,
    ) {
        for connection_id in targets {
            if exclude_user.is_some() && self.connection_user(connection_id) == exclude_user {
                continue;
            }
            self.push(connection_id, event.clone());
        }
    }

    fn evict(&self, connection_id: ConnectionId) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.sender = None;
        }
    }
}

fn push_payload(conversation: &Conversation, message: &Message) -> NotificationPayload {
    let title = conversation
        .name
        .clone()
        .unwrap_or_else(|| "New message".to_owned());
    NotificationPayload::new(title, message.content.preview(PUSH_PREVIEW_CHARS))
        .with_data(serde_json::json!({
            "conversation_id": conversation.id,
            "message_id": message.id,
            "sequence": message.sequence,
        }))
        .for_message(message.id)
}
