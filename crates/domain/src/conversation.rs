use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 会话：私聊（恰好两人）或群聊。
///
/// 会话从不物理删除，只会归档。成员集合只能通过增删成员改变，
/// `sequence_counter` 只由消息存储在追加消息时递增。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: BTreeSet<UserId>,
    pub name: Option<String>,
    pub is_group: bool,
    pub sequence_counter: u64,
    pub archived_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        participants: impl IntoIterator<Item = UserId>,
        is_group: bool,
        name: Option<String>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let participants: BTreeSet<UserId> = participants.into_iter().collect();
        if participants.len() < 2 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "at least 2 unique participants required",
            ));
        }
        if !is_group && participants.len() != 2 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "a direct conversation has exactly 2 participants",
            ));
        }
        let name = match name.map(|n| n.trim().to_owned()) {
            Some(n) if n.is_empty() => None,
            Some(n) if n.chars().count() > 100 => {
                return Err(DomainError::invalid_argument("name", "too long"));
            }
            other => other,
        };

        Ok(Self {
            id,
            participants,
            name,
            is_group,
            sequence_counter: 0,
            archived_at: None,
            created_at,
        })
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<(), DomainError> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::NotAParticipant)
        }
    }

    pub fn ensure_writable(&self) -> Result<(), DomainError> {
        if self.is_archived() {
            Err(DomainError::ConversationArchived)
        } else {
            Ok(())
        }
    }

    /// 加入成员，返回是否真正发生变化
    pub fn add_participant(&mut self, user_id: UserId) -> Result<bool, DomainError> {
        self.ensure_writable()?;
        if !self.is_group {
            return Err(DomainError::NotAGroup);
        }
        Ok(self.participants.insert(user_id))
    }

    /// 移除成员。群聊至少保留两名成员。
    pub fn remove_participant(&mut self, user_id: UserId) -> Result<bool, DomainError> {
        self.ensure_writable()?;
        if !self.is_group {
            return Err(DomainError::NotAGroup);
        }
        if !self.participants.contains(&user_id) {
            return Ok(false);
        }
        if self.participants.len() <= 2 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "a group keeps at least 2 participants",
            ));
        }
        Ok(self.participants.remove(&user_id))
    }

    pub fn archive(&mut self, at: Timestamp) {
        if self.archived_at.is_none() {
            self.archived_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn users(n: usize) -> Vec<UserId> {
        (0..n).map(|_| UserId::random()).collect()
    }

    #[test]
    fn requires_two_unique_participants() {
        let a = UserId::random();
        let err = Conversation::new(ConversationId::random(), [a, a], false, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument { .. }));

        let err = Conversation::new(ConversationId::random(), [], true, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument { .. }));
    }

    #[test]
    fn direct_conversation_is_exactly_two() {
        let result = Conversation::new(ConversationId::random(), users(3), false, None, Utc::now());
        assert!(result.is_err());

        let conversation =
            Conversation::new(ConversationId::random(), users(3), true, Some(" team ".into()), Utc::now())
                .unwrap();
        assert_eq!(conversation.name.as_deref(), Some("team"));
        assert_eq!(conversation.sequence_counter, 0);
    }

    #[test]
    fn outsiders_are_not_participants() {
        let members = users(3);
        let conversation =
            Conversation::new(ConversationId::random(), members.clone(), true, None, Utc::now())
                .unwrap();
        assert_eq!(conversation.ensure_participant(members[0]), Ok(()));
        assert_eq!(
            conversation.ensure_participant(UserId::random()),
            Err(DomainError::NotAParticipant)
        );
    }

    #[test]
    fn archived_conversation_rejects_membership_changes() {
        let mut conversation =
            Conversation::new(ConversationId::random(), users(3), true, None, Utc::now()).unwrap();
        conversation.archive(Utc::now());
        assert_eq!(
            conversation.add_participant(UserId::random()),
            Err(DomainError::ConversationArchived)
        );
    }

    #[test]
    fn group_keeps_two_members() {
        let members = users(2);
        let mut conversation =
            Conversation::new(ConversationId::random(), members.clone(), true, None, Utc::now())
                .unwrap();
        assert!(conversation.remove_participant(members[0]).is_err());
        assert_eq!(conversation.add_participant(UserId::random()), Ok(true));
        assert_eq!(conversation.remove_participant(members[0]), Ok(true));
    }
}
