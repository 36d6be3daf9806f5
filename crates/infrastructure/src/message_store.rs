use std::collections::{BTreeMap, BTreeSet, HashMap};

use application::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Conversation, ConversationId, DeliveryState, DeliveryUpdate, Message, MessageContent,
    MessageId, NewMessage, RepositoryError, Timestamp, UserId,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::repository::{invalid_data, map_sqlx_err};

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    name: Option<String>,
    is_group: bool,
    sequence_counter: i64,
    archived_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ConversationRecord {
    fn into_conversation(self, participants: BTreeSet<UserId>) -> Conversation {
        Conversation {
            id: ConversationId::from(self.id),
            participants,
            name: self.name,
            is_group: self.is_group,
            sequence_counter: self.sequence_counter.max(0) as u64,
            archived_at: self.archived_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    sequence: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DeliveryRecord {
    message_id: Uuid,
    user_id: Uuid,
    state: i16,
}

#[derive(Debug, FromRow)]
struct ParticipantRecord {
    conversation_id: Uuid,
    user_id: Uuid,
}

fn decode_state(value: i16) -> Result<DeliveryState, RepositoryError> {
    DeliveryState::from_i16(value)
        .ok_or_else(|| invalid_data(format!("unknown delivery state {value}")))
}

fn into_message(
    record: MessageRecord,
    delivery: BTreeMap<UserId, DeliveryState>,
) -> Result<Message, RepositoryError> {
    let content =
        MessageContent::new(record.content).map_err(|err| invalid_data(err.to_string()))?;
    Ok(Message {
        id: MessageId::from(record.id),
        conversation_id: ConversationId::from(record.conversation_id),
        sender_id: UserId::from(record.sender_id),
        content,
        sequence: record.sequence.max(0) as u64,
        created_at: record.created_at,
        delivery,
    })
}

const CONVERSATION_COLUMNS: &str =
    "c.id, c.name, c.is_group, c.sequence_counter, c.archived_at, c.created_at";

/// PostgreSQL 消息存储
///
/// 序号分配依赖 `UPDATE ... SET sequence_counter = sequence_counter + 1 RETURNING`，
/// 行锁一直持有到同一事务内的消息写入提交，因此同一会话的并发追加被串行化。
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn participants_of(
        &self,
        conversation_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, BTreeSet<UserId>>, RepositoryError> {
        let rows = sqlx::query_as::<_, ParticipantRecord>(
            r#"
            SELECT conversation_id, user_id
            FROM conversation_participants
            WHERE conversation_id = ANY($1)
            "#,
        )
        .bind(conversation_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut grouped: HashMap<Uuid, BTreeSet<UserId>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.conversation_id)
                .or_default()
                .insert(UserId::from(row.user_id));
        }
        Ok(grouped)
    }

    async fn hydrate_conversations(
        &self,
        records: Vec<ConversationRecord>,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut participants = self.participants_of(&ids).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let members = participants.remove(&record.id).unwrap_or_default();
                record.into_conversation(members)
            })
            .collect())
    }

    async fn hydrate_messages(
        &self,
        records: Vec<MessageRecord>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let rows = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT message_id, user_id, state
            FROM message_deliveries
            WHERE message_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut deliveries: HashMap<Uuid, BTreeMap<UserId, DeliveryState>> = HashMap::new();
        for row in rows {
            deliveries
                .entry(row.message_id)
                .or_default()
                .insert(UserId::from(row.user_id), decode_state(row.state)?);
        }

        records
            .into_iter()
            .map(|record| {
                let delivery = deliveries.remove(&record.id).unwrap_or_default();
                into_message(record, delivery)
            })
            .collect()
    }

    /// 锁住会话行并检查可写性
    async fn lock_writable(
        tx: &mut Transaction<'_, Postgres>,
        id: ConversationId,
    ) -> Result<(), RepositoryError> {
        let archived: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT archived_at FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

        match archived {
            None => Err(RepositoryError::NotFound),
            Some(Some(_)) => Err(RepositoryError::Conflict),
            Some(None) => Ok(()),
        }
    }

    async fn require_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Conversation, RepositoryError> {
        self.find_conversation(id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn advance(
        &self,
        message_id: MessageId,
        user_id: UserId,
        target: DeliveryState,
    ) -> Result<DeliveryUpdate, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let current: Option<i16> = sqlx::query_scalar(
            r#"
            SELECT state FROM message_deliveries
            WHERE message_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let current = decode_state(current.ok_or(RepositoryError::NotFound)?)?;
        let (state, changed) = current.advance(target);
        if changed {
            sqlx::query(
                r#"
                UPDATE message_deliveries
                SET state = $3, updated_at = now()
                WHERE message_id = $1 AND user_id = $2
                "#,
            )
            .bind(Uuid::from(message_id))
            .bind(Uuid::from(user_id))
            .bind(state.as_i16())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(DeliveryUpdate { state, changed })
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Conversation, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, name, is_group, sequence_counter, archived_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(&conversation.name)
        .bind(conversation.is_group)
        .bind(conversation.sequence_counter as i64)
        .bind(conversation.archived_at)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let members: Vec<Uuid> = conversation
            .participants
            .iter()
            .map(|id| Uuid::from(*id))
            .collect();
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
            SELECT $1, member, $3 FROM UNNEST($2::uuid[]) AS member
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(&members)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(conversation)
    }

    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Ok(self.hydrate_conversations(vec![record]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations c
            JOIN conversation_participants pa ON pa.conversation_id = c.id AND pa.user_id = $1
            JOIN conversation_participants pb ON pb.conversation_id = c.id AND pb.user_id = $2
            WHERE c.is_group = FALSE AND c.archived_at IS NULL
            ORDER BY c.created_at
            LIMIT 1
            "#
        ))
        .bind(Uuid::from(a))
        .bind(Uuid::from(b))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Ok(self.hydrate_conversations(vec![record]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1 AND c.archived_at IS NULL
            ORDER BY c.created_at
            "#
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.hydrate_conversations(records).await
    }

    async fn add_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Self::lock_writable(&mut tx, id).await?;
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)?;

        self.require_conversation(id).await
    }

    async fn remove_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Self::lock_writable(&mut tx, id).await?;
        sqlx::query(
            "DELETE FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(user_id))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)?;

        self.require_conversation(id).await
    }

    async fn archive_conversation(
        &self,
        id: ConversationId,
        at: Timestamp,
    ) -> Result<Conversation, RepositoryError> {
        let result = sqlx::query(
            "UPDATE conversations SET archived_at = COALESCE(archived_at, $2) WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        self.require_conversation(id).await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        let conversation_id = Uuid::from(message.conversation_id);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 行锁持有到提交，同一会话的追加在这里排队
        let sequence: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE conversations
            SET sequence_counter = sequence_counter + 1
            WHERE id = $1 AND archived_at IS NULL
            RETURNING sequence_counter
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let Some(sequence) = sequence else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                    .bind(conversation_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;
            return Err(if exists {
                RepositoryError::Conflict
            } else {
                RepositoryError::NotFound
            });
        };

        let participants: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let message = message.into_message(
            sequence as u64,
            participants.into_iter().map(UserId::from),
        );

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, sequence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(conversation_id)
        .bind(Uuid::from(message.sender_id))
        .bind(message.content.as_str())
        .bind(sequence)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let recipients: Vec<Uuid> = message.delivery.keys().map(|id| Uuid::from(*id)).collect();
        sqlx::query(
            r#"
            INSERT INTO message_deliveries (message_id, user_id, state)
            SELECT $1, recipient, $3 FROM UNNEST($2::uuid[]) AS recipient
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(&recipients)
        .bind(DeliveryState::Sent.as_i16())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(message)
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, conversation_id, sender_id, content, sequence, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Ok(self.hydrate_messages(vec![record]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn messages_after(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                .bind(Uuid::from(conversation_id))
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        if !exists {
            return Err(RepositoryError::NotFound);
        }

        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, conversation_id, sender_id, content, sequence, created_at
            FROM messages
            WHERE conversation_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(after_sequence as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.hydrate_messages(records).await
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
        let state: Option<i16> = sqlx::query_scalar(
            "SELECT state FROM message_deliveries WHERE message_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        state.map(decode_state).transpose()
    }
}
