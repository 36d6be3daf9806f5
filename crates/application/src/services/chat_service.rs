use std::sync::Arc;

use domain::{
    ConnectionId, Conversation, ConversationId, DeliveryUpdate, DevicePlatform, DeviceToken, DomainError,
    Message, MessageContent, MessageId, NewMessage, NotificationPreference, UserId,
};
use futures::TryStreamExt;

use crate::{
    catch_up::list_messages,
    clock::Clock,
    error::ApplicationError,
    message_store::MessageStore,
    repository::{DeviceTokenRepository, PreferenceRepository},
    room::ConversationRooms,
};

/// 追赶拉取的默认与最大条数
pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub creator_id: UserId,
    /// 创建者总是会被加入，这里可以不包含
    pub participant_ids: Vec<UserId>,
    pub is_group: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    /// 经实时通道发送时的来源连接，它只收到 `message_accepted`
    pub origin: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct RegisterDeviceTokenRequest {
    pub user_id: UserId,
    pub token: String,
    pub platform: DevicePlatform,
}

/// 未提供的字段保持原值
#[derive(Debug, Clone, Default)]
pub struct UpdatePreferencesRequest {
    pub message: Option<bool>,
    pub alert: Option<bool>,
    pub event: Option<bool>,
    pub help_request: Option<bool>,
}

pub struct ChatServiceDependencies {
    pub store: Arc<dyn MessageStore>,
    pub rooms: Arc<ConversationRooms>,
    pub device_tokens: Arc<dyn DeviceTokenRepository>,
    pub preferences: Arc<dyn PreferenceRepository>,
    pub clock: Arc<dyn Clock>,
}

/// HTTP 与实时通道共用的用例服务
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    /// 创建会话。两人之间已有私聊时直接返回已有会话。
    pub async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ApplicationError> {
        let mut participants = request.participant_ids;
        participants.push(request.creator_id);
        participants.sort();
        participants.dedup();

        if !request.is_group && participants.len() == 2 {
            if let Some(existing) = self
                .deps
                .store
                .find_direct_conversation(participants[0], participants[1])
                .await?
            {
                return Ok(existing);
            }
        }

        let conversation = Conversation::new(
            ConversationId::random(),
            participants,
            request.is_group,
            request.name,
            self.deps.clock.now(),
        )?;
        let conversation = self.deps.store.create_conversation(conversation).await?;

        for participant in &conversation.participants {
            self.deps.rooms.join_user(conversation.id, *participant);
        }
        tracing::info!(
            conversation_id = %conversation.id,
            creator_id = %request.creator_id,
            participants = conversation.participants.len(),
            is_group = conversation.is_group,
            "conversation created"
        );
        Ok(conversation)
    }

    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, ApplicationError> {
        Ok(self.deps.store.list_conversations_for_user(user_id).await?)
    }

    /// 追赶拉取：返回 `after_sequence` 之后至多 `limit` 条消息
    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        after_sequence: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.member_conversation(conversation_id, user_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        list_messages(
            self.deps.store.clone(),
            conversation_id,
            after_sequence,
            Some(limit),
        )
        .try_collect()
        .await
    }

    /// 发送消息。发送者同步得到成功或失败；投递给接收者的失败不会回传给发送者。
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(request.content)?;
        let conversation = self
            .member_conversation(request.conversation_id, request.sender_id)
            .await?;
        conversation.ensure_writable()?;

        let message = self
            .deps
            .store
            .append_message(NewMessage::new(
                conversation.id,
                request.sender_id,
                content,
                self.deps.clock.now(),
            ))
            .await?;

        tracing::info!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            sender_id = %message.sender_id,
            sequence = message.sequence,
            "message appended"
        );

        self.deps
            .rooms
            .broadcast_message(&conversation, &message, request.origin)
            .await;
        Ok(message)
    }

    /// 标记已读并广播回执。发送者对自己的消息调用时返回 `None`。
    pub async fn mark_read(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<Option<DeliveryUpdate>, ApplicationError> {
        let message = self.member_message(message_id, user_id).await?;
        if message.sender_id == user_id {
            return Ok(None);
        }
        let update = self.deps.store.mark_read(message_id, user_id).await?;
        if update.changed {
            self.deps
                .rooms
                .broadcast_read_receipt(message.conversation_id, message_id, user_id);
        }
        Ok(Some(update))
    }

    /// 客户端显式送达确认，幂等
    pub async fn acknowledge_delivery(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<Option<DeliveryUpdate>, ApplicationError> {
        let message = self.member_message(message_id, user_id).await?;
        if message.sender_id == user_id {
            return Ok(None);
        }
        Ok(Some(self.deps.store.mark_delivered(message_id, user_id).await?))
    }

    pub async fn add_participant(
        &self,
        operator_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let mut conversation = self.member_conversation(conversation_id, operator_id).await?;
        if !conversation.add_participant(user_id)? {
            return Ok(conversation);
        }
        let conversation = self
            .deps
            .store
            .add_participant(conversation_id, user_id)
            .await?;
        self.deps.rooms.join_user(conversation_id, user_id);
        tracing::info!(
            conversation_id = %conversation_id,
            operator_id = %operator_id,
            user_id = %user_id,
            "participant added"
        );
        Ok(conversation)
    }

    pub async fn remove_participant(
        &self,
        operator_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let mut conversation = self.member_conversation(conversation_id, operator_id).await?;
        if !conversation.remove_participant(user_id)? {
            return Err(DomainError::NotAParticipant.into());
        }
        let conversation = self
            .deps
            .store
            .remove_participant(conversation_id, user_id)
            .await?;
        self.deps.rooms.leave_user(conversation_id, user_id);
        tracing::info!(
            conversation_id = %conversation_id,
            operator_id = %operator_id,
            user_id = %user_id,
            "participant removed"
        );
        Ok(conversation)
    }

    pub async fn archive_conversation(
        &self,
        operator_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        self.member_conversation(conversation_id, operator_id).await?;
        let conversation = self
            .deps
            .store
            .archive_conversation(conversation_id, self.deps.clock.now())
            .await?;
        tracing::info!(conversation_id = %conversation_id, operator_id = %operator_id, "conversation archived");
        Ok(conversation)
    }

    pub async fn register_device_token(
        &self,
        request: RegisterDeviceTokenRequest,
    ) -> Result<DeviceToken, ApplicationError> {
        let token = DeviceToken::register(
            request.user_id,
            request.token,
            request.platform,
            self.deps.clock.now(),
        )?;
        let token = self.deps.device_tokens.register(token).await?;
        tracing::info!(user_id = %token.user_id, platform = %token.platform, "device token registered");
        Ok(token)
    }

    pub async fn unregister_device_token(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<(), ApplicationError> {
        if self.deps.device_tokens.unregister(user_id, token).await? {
            tracing::info!(user_id = %user_id, "device token unregistered");
            Ok(())
        } else {
            Err(domain::RepositoryError::NotFound.into())
        }
    }

    pub async fn notification_settings(
        &self,
        user_id: UserId,
    ) -> Result<NotificationPreference, ApplicationError> {
        Ok(self
            .deps
            .preferences
            .find(user_id)
            .await?
            .unwrap_or_else(|| NotificationPreference::all_enabled(user_id, self.deps.clock.now())))
    }

    pub async fn update_notification_settings(
        &self,
        user_id: UserId,
        request: UpdatePreferencesRequest,
    ) -> Result<NotificationPreference, ApplicationError> {
        let mut preference = self.notification_settings(user_id).await?;
        if let Some(value) = request.message {
            preference.message = value;
        }
        if let Some(value) = request.alert {
            preference.alert = value;
        }
        if let Some(value) = request.event {
            preference.event = value;
        }
        if let Some(value) = request.help_request {
            preference.help_request = value;
        }
        preference.updated_at = self.deps.clock.now();
        Ok(self.deps.preferences.upsert(preference).await?)
    }

    /// 读取会话并确认 `user_id` 是成员
    pub async fn member_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self
            .deps
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or(DomainError::ConversationNotFound)?;
        conversation.ensure_participant(user_id).map_err(|_| {
            ApplicationError::authorization(format!(
                "user {user_id} is not a participant of conversation {conversation_id}"
            ))
        })?;
        Ok(conversation)
    }

    async fn member_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Message, ApplicationError> {
        let message = self
            .deps
            .store
            .find_message(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;
        self.member_conversation(message.conversation_id, user_id)
            .await?;
        Ok(message)
    }
}
