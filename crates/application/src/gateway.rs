//! 连接网关
//!
//! 负责实时连接的鉴权、在线状态登记、加入房间，以及把客户端事件
//! 分派到对应组件。网关本身不持有持久状态。

use std::sync::Arc;

use domain::{ClientEvent, ConnectionId, ConversationId, ServerEvent, UserId};
use tokio::sync::mpsc;

use crate::error::ApplicationError;
use crate::message_store::MessageStore;
use crate::presence::PresenceTracker;
use crate::room::ConversationRooms;
use crate::services::{ChatService, SendMessageRequest};
use crate::session::SessionVerifier;
use crate::typing::TypingCoordinator;

/// 已鉴权并登记的连接。`events` 是该连接的出站事件队列。
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct GatewayDependencies {
    pub verifier: Arc<dyn SessionVerifier>,
    pub store: Arc<dyn MessageStore>,
    pub presence: Arc<PresenceTracker>,
    pub rooms: Arc<ConversationRooms>,
    pub typing: Arc<TypingCoordinator>,
    pub chat: Arc<ChatService>,
}

pub struct ConnectionGateway {
    deps: GatewayDependencies,
    outbound_buffer: usize,
}

impl ConnectionGateway {
    pub fn new(deps: GatewayDependencies, outbound_buffer: usize) -> Self {
        Self {
            deps,
            outbound_buffer,
        }
    }

    pub async fn on_connect(&self, credential: &str) -> Result<ConnectionHandle, ApplicationError> {
        let user_id = self.deps.verifier.verify(credential).await?;
        let conversations = self.deps.store.list_conversations_for_user(user_id).await?;
        let conversation_ids: Vec<ConversationId> = conversations.iter().map(|c| c.id).collect();

        let connection_id = ConnectionId::random();
        let (sender, events) = mpsc::channel(self.outbound_buffer);
        self.deps.rooms.bind_connection(connection_id, user_id, sender);
        for conversation_id in &conversation_ids {
            self.deps.rooms.join(*conversation_id, connection_id);
        }

        let came_online = self.deps.presence.add_connection(user_id, connection_id);
        if came_online {
            self.deps
                .rooms
                .broadcast_presence(user_id, true, &conversation_ids);
        }

        self.deps.rooms.push(
            connection_id,
            ServerEvent::Ready {
                user_id,
                conversation_ids,
            },
        );

        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            came_online,
            "realtime connection established"
        );
        Ok(ConnectionHandle {
            connection_id,
            user_id,
            events,
        })
    }

    /// 注销连接。用户最后一条连接断开时清除输入状态并广播离线。
    pub async fn on_disconnect(&self, connection_id: ConnectionId) {
        let Some((user_id, conversations)) = self.deps.rooms.unbind_connection(connection_id)
        else {
            return;
        };

        let went_offline = self.deps.presence.remove_connection(user_id, connection_id);
        if went_offline {
            self.deps.typing.clear_user(user_id);
            self.deps
                .rooms
                .broadcast_presence(user_id, false, &conversations);
        }

        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            went_offline,
            "realtime connection closed"
        );
    }

    /// 处理一条客户端事件。失败时会向该连接推送 `error` 事件并返回错误。
    pub async fn on_client_event(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), ApplicationError> {
        let kind = event.kind();
        let result = self.handle(connection_id, event).await;
        if let Err(err) = &result {
            match err {
                ApplicationError::Authorization(_) => tracing::warn!(
                    connection_id = %connection_id,
                    event = kind,
                    error = %err,
                    "client event rejected"
                ),
                _ => tracing::debug!(
                    connection_id = %connection_id,
                    event = kind,
                    error = %err,
                    "client event failed"
                ),
            }
            self.deps
                .rooms
                .push(connection_id, ServerEvent::error(err.code(), err.to_string()));
        }
        result
    }

    async fn handle(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), ApplicationError> {
        let user_id = self
            .deps
            .rooms
            .connection_user(connection_id)
            .ok_or_else(|| ApplicationError::Authentication("unknown connection".into()))?;

        match event {
            ClientEvent::SendMessage {
                conversation_id,
                content,
                client_ref,
            } => {
                let message = self
                    .deps
                    .chat
                    .send_message(SendMessageRequest {
                        conversation_id,
                        sender_id: user_id,
                        content,
                        origin: Some(connection_id),
                    })
                    .await?;
                self.deps.typing.stop_typing(conversation_id, user_id);
                self.deps.rooms.push(
                    connection_id,
                    ServerEvent::MessageAccepted {
                        client_ref,
                        message,
                    },
                );
            }
            ClientEvent::JoinConversation { conversation_id } => {
                self.deps
                    .chat
                    .member_conversation(conversation_id, user_id)
                    .await?;
                self.deps.rooms.join(conversation_id, connection_id);
            }
            ClientEvent::TypingStart { conversation_id } => {
                self.deps
                    .chat
                    .member_conversation(conversation_id, user_id)
                    .await?;
                self.deps.typing.start_typing(conversation_id, user_id);
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.deps
                    .chat
                    .member_conversation(conversation_id, user_id)
                    .await?;
                self.deps.typing.stop_typing(conversation_id, user_id);
            }
            ClientEvent::MarkRead { message_id } => {
                self.deps.chat.mark_read(user_id, message_id).await?;
            }
            ClientEvent::AckDelivered { message_id } => {
                self.deps
                    .chat
                    .acknowledge_delivery(user_id, message_id)
                    .await?;
            }
        }
        Ok(())
    }
}
