use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, DeliveryState, DeliveryUpdate, Message, MessageId, NewMessage,
    RepositoryError, Timestamp, UserId,
};

/// 会话成员、消息内容与顺序的唯一数据源。
///
/// `append_message` 是系统中唯一需要串行化的操作：同一会话的并发调用
/// 必须得到连续且不重复的序号。实现可以使用会话级互斥，也可以依赖
/// 存储层的原子自增。
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Conversation, RepositoryError>;

    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// 两人之间未归档的私聊
    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// 用户参与的所有未归档会话
    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError>;

    /// 已归档的会话返回 `Conflict`
    async fn add_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError>;

    async fn remove_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError>;

    async fn archive_conversation(
        &self,
        id: ConversationId,
        at: Timestamp,
    ) -> Result<Conversation, RepositoryError>;

    /// 原子地递增会话序号并持久化消息。
    /// 会话不存在返回 `NotFound`，已归档返回 `Conflict`。
    async fn append_message(&self, message: NewMessage) -> Result<Message, RepositoryError>;

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 序号大于 `after_sequence` 的一页消息，升序
    async fn messages_after(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// (message, user) 不是投递关系时返回 `NotFound`
    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<DeliveryUpdate, RepositoryError>;

    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<DeliveryUpdate, RepositoryError>;

    async fn delivery_state(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Option<DeliveryState>, RepositoryError>;
}

pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct ConversationLog {
        conversation: Conversation,
        /// 下标即 `sequence - 1`
        messages: Vec<Message>,
    }

    /// 内存实现。每个会话一把异步锁，同一会话内的写入串行，
    /// 不同会话之间完全并行。
    #[derive(Default)]
    pub struct MemoryMessageStore {
        conversations: DashMap<ConversationId, Arc<Mutex<ConversationLog>>>,
        message_index: DashMap<MessageId, (ConversationId, u64)>,
    }

    impl MemoryMessageStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn log(&self, id: ConversationId) -> Option<Arc<Mutex<ConversationLog>>> {
            self.conversations.get(&id).map(|entry| entry.value().clone())
        }

        fn all_logs(&self) -> Vec<Arc<Mutex<ConversationLog>>> {
            self.conversations
                .iter()
                .map(|entry| entry.value().clone())
                .collect()
        }

        async fn advance(
            &self,
            message_id: MessageId,
            user_id: UserId,
            target: DeliveryState,
        ) -> Result<DeliveryUpdate, RepositoryError> {
            let (conversation_id, sequence) = self
                .message_index
                .get(&message_id)
                .map(|entry| *entry.value())
                .ok_or(RepositoryError::NotFound)?;
            let log = self.log(conversation_id).ok_or(RepositoryError::NotFound)?;
            let mut log = log.lock().await;
            let message = log
                .messages
                .get_mut((sequence - 1) as usize)
                .ok_or(RepositoryError::NotFound)?;
            message
                .advance(user_id, target)
                .ok_or(RepositoryError::NotFound)
        }
    }

    #[async_trait]
    impl MessageStore for MemoryMessageStore {
        async fn create_conversation(
            &self,
            conversation: Conversation,
        ) -> Result<Conversation, RepositoryError> {
            use dashmap::mapref::entry::Entry;
            match self.conversations.entry(conversation.id) {
                Entry::Occupied(_) => Err(RepositoryError::Conflict),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Mutex::new(ConversationLog {
                        conversation: conversation.clone(),
                        messages: Vec::new(),
                    })));
                    Ok(conversation)
                }
            }
        }

        async fn find_conversation(
            &self,
            id: ConversationId,
        ) -> Result<Option<Conversation>, RepositoryError> {
            let Some(log) = self.log(id) else {
                return Ok(None);
            };
            let conversation = log.lock().await.conversation.clone();
            Ok(Some(conversation))
        }

        async fn find_direct_conversation(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<Option<Conversation>, RepositoryError> {
            for log in self.all_logs() {
                let log = log.lock().await;
                let c = &log.conversation;
                if !c.is_group && !c.is_archived() && c.is_participant(a) && c.is_participant(b) {
                    return Ok(Some(c.clone()));
                }
            }
            Ok(None)
        }

        async fn list_conversations_for_user(
            &self,
            user_id: UserId,
        ) -> Result<Vec<Conversation>, RepositoryError> {
            let mut found = Vec::new();
            for log in self.all_logs() {
                let log = log.lock().await;
                if log.conversation.is_participant(user_id) && !log.conversation.is_archived() {
                    found.push(log.conversation.clone());
                }
            }
            found.sort_by_key(|c| c.created_at);
            Ok(found)
        }

        async fn add_participant(
            &self,
            id: ConversationId,
            user_id: UserId,
        ) -> Result<Conversation, RepositoryError> {
            let log = self.log(id).ok_or(RepositoryError::NotFound)?;
            let mut log = log.lock().await;
            if log.conversation.is_archived() {
                return Err(RepositoryError::Conflict);
            }
            log.conversation.participants.insert(user_id);
            Ok(log.conversation.clone())
        }

        async fn remove_participant(
            &self,
            id: ConversationId,
            user_id: UserId,
        ) -> Result<Conversation, RepositoryError> {
            let log = self.log(id).ok_or(RepositoryError::NotFound)?;
            let mut log = log.lock().await;
            if log.conversation.is_archived() {
                return Err(RepositoryError::Conflict);
            }
            log.conversation.participants.remove(&user_id);
            Ok(log.conversation.clone())
        }

        async fn archive_conversation(
            &self,
            id: ConversationId,
            at: Timestamp,
        ) -> Result<Conversation, RepositoryError> {
            let log = self.log(id).ok_or(RepositoryError::NotFound)?;
            let mut log = log.lock().await;
            log.conversation.archive(at);
            Ok(log.conversation.clone())
        }

        async fn append_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
            let log = self
                .log(message.conversation_id)
                .ok_or(RepositoryError::NotFound)?;
            let mut log = log.lock().await;
            if log.conversation.is_archived() {
                return Err(RepositoryError::Conflict);
            }

            log.conversation.sequence_counter += 1;
            let sequence = log.conversation.sequence_counter;
            let recipients: Vec<UserId> = log.conversation.participants.iter().copied().collect();
            let message = message.into_message(sequence, recipients);

            self.message_index
                .insert(message.id, (message.conversation_id, sequence));
            log.messages.push(message.clone());
            Ok(message)
        }

        async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            let Some((conversation_id, sequence)) =
                self.message_index.get(&id).map(|entry| *entry.value())
            else {
                return Ok(None);
            };
            let Some(log) = self.log(conversation_id) else {
                return Ok(None);
            };
            let log = log.lock().await;
            Ok(log.messages.get((sequence - 1) as usize).cloned())
        }

        async fn messages_after(
            &self,
            conversation_id: ConversationId,
            after_sequence: u64,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            let log = self.log(conversation_id).ok_or(RepositoryError::NotFound)?;
            let log = log.lock().await;
            Ok(log
                .messages
                .iter()
                .skip(after_sequence as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn mark_delivered(
            &self,
            message_id: MessageId,
            user_id: UserId,
        ) -> Result<DeliveryUpdate, RepositoryError> {
            self.advance(message_id, user_id, DeliveryState::Delivered)
                .await
        }

        async fn mark_read(
            &self,
            message_id: MessageId,
            user_id: UserId,
        ) -> Result<DeliveryUpdate, RepositoryError> {
            self.advance(message_id, user_id, DeliveryState::Read).await
        }

        async fn delivery_state(
            &self,
            message_id: MessageId,
            user_id: UserId,
        ) -> Result<Option<DeliveryState>, RepositoryError> {
            Ok(self
                .find_message(message_id)
                .await?
                .and_then(|message| message.delivery_state(user_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryMessageStore;
    use super::*;
    use chrono::Utc;
    use domain::MessageContent;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    async fn conversation(store: &MemoryMessageStore, members: &[UserId]) -> Conversation {
        let conversation = Conversation::new(
            ConversationId::random(),
            members.iter().copied(),
            members.len() > 2,
            None,
            Utc::now(),
        )
        .unwrap();
        store.create_conversation(conversation).await.unwrap()
    }

    fn text(conversation_id: ConversationId, sender: UserId, body: &str) -> NewMessage {
        NewMessage::new(
            conversation_id,
            sender,
            MessageContent::new(body).unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn concurrent_appends_get_contiguous_sequences() {
        let store = Arc::new(MemoryMessageStore::new());
        let members = [UserId::random(), UserId::random(), UserId::random()];
        let conversation_id = conversation(&store, &members).await.id;

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            let sender = members[i % members.len()];
            handles.push(tokio::spawn(async move {
                store
                    .append_message(text(conversation_id, sender, "hi"))
                    .await
                    .unwrap()
                    .sequence
            }));
        }

        let mut sequences = BTreeSet::new();
        for handle in handles {
            assert!(sequences.insert(handle.await.unwrap()));
        }
        assert_eq!(sequences, (1..=64).collect::<BTreeSet<u64>>());

        let stored = store.find_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(stored.sequence_counter, 64);
    }

    #[tokio::test]
    async fn archived_conversation_rejects_append() {
        let store = MemoryMessageStore::new();
        let members = [UserId::random(), UserId::random()];
        let conversation = conversation(&store, &members).await;
        store
            .archive_conversation(conversation.id, Utc::now())
            .await
            .unwrap();

        let err = store
            .append_message(text(conversation.id, members[0], "late"))
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::Conflict);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = MemoryMessageStore::new();
        let err = store
            .append_message(text(ConversationId::random(), UserId::random(), "x"))
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::NotFound);
    }

    #[tokio::test]
    async fn read_implies_delivered_and_never_downgrades() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = (UserId::random(), UserId::random());
        let conversation = conversation(&store, &[alice, bob]).await;
        let message = store
            .append_message(text(conversation.id, alice, "hello"))
            .await
            .unwrap();
        assert_eq!(message.delivery_state(bob), Some(DeliveryState::Sent));

        let update = store.mark_read(message.id, bob).await.unwrap();
        assert_eq!(update.state, DeliveryState::Read);
        assert!(update.changed);

        let update = store.mark_delivered(message.id, bob).await.unwrap();
        assert_eq!(update.state, DeliveryState::Read);
        assert!(!update.changed);

        assert_eq!(
            store.delivery_state(message.id, bob).await.unwrap(),
            Some(DeliveryState::Read)
        );
        assert_eq!(
            store.mark_read(message.id, alice).await.unwrap_err(),
            RepositoryError::NotFound
        );
    }

    #[tokio::test]
    async fn messages_after_pages_in_order() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = (UserId::random(), UserId::random());
        let conversation = conversation(&store, &[alice, bob]).await;
        for i in 0..5 {
            store
                .append_message(text(conversation.id, alice, &format!("m{i}")))
                .await
                .unwrap();
        }

        let page = store.messages_after(conversation.id, 2, 2).await.unwrap();
        let sequences: Vec<u64> = page.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert!(store
            .messages_after(conversation.id, 5, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn direct_lookup_ignores_groups() {
        let store = MemoryMessageStore::new();
        let (alice, bob, carol) = (UserId::random(), UserId::random(), UserId::random());
        conversation(&store, &[alice, bob, carol]).await;
        assert!(store
            .find_direct_conversation(alice, bob)
            .await
            .unwrap()
            .is_none());

        let direct = conversation(&store, &[alice, bob]).await;
        let found = store.find_direct_conversation(bob, alice).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(direct.id));
        assert_eq!(store.list_conversations_for_user(alice).await.unwrap().len(), 2);
        assert_eq!(store.list_conversations_for_user(carol).await.unwrap().len(), 1);
    }
}
