use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ConversationId, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::room::ConversationRooms;

/// 输入状态协调器
///
/// (会话, 用户) -> 过期时间 的并发表，由一个周期性清扫任务统一过期，
/// 不为每条记录单独起定时器。每次进入输入状态广播一次 start，
/// 记录被移除（显式停止、过期、断线）时恰好广播一次 stop。
/// 广播在持有该键的表项锁时发出，同一 (会话, 用户) 的 start/stop 不会乱序。
pub struct TypingCoordinator {
    entries: DashMap<(ConversationId, UserId), Instant>,
    ttl: Duration,
    rooms: Arc<ConversationRooms>,
}

impl TypingCoordinator {
    pub fn new(rooms: Arc<ConversationRooms>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            rooms,
        }
    }

    /// 返回是否广播了 `typing_start`。已在输入状态时只刷新过期时间。
    pub fn start_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        let expires_at = Instant::now() + self.ttl;
        match self.entries.entry((conversation_id, user_id)) {
            Entry::Occupied(mut entry) => {
                entry.insert(expires_at);
                false
            }
            Entry::Vacant(entry) => {
                let _guard = entry.insert(expires_at);
                self.rooms.broadcast_typing(conversation_id, user_id, true);
                true
            }
        }
    }

    /// 返回是否广播了 `typing_stop`，重复停止不会重复广播
    pub fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        match self.entries.entry((conversation_id, user_id)) {
            Entry::Occupied(entry) => {
                self.rooms.broadcast_typing(conversation_id, user_id, false);
                entry.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// 清理已过期的记录，返回过期条数
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(ConversationId, UserId)> = self
            .entries
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for key in expired {
            // 期间被刷新过的记录保留
            if let Entry::Occupied(entry) = self.entries.entry(key) {
                if *entry.get() <= now {
                    self.rooms.broadcast_typing(key.0, key.1, false);
                    entry.remove();
                    count += 1;
                }
            }
        }
        count
    }

    /// 用户最后一条连接断开时清除其全部输入状态
    pub fn clear_user(&self, user_id: UserId) -> usize {
        let keys: Vec<(ConversationId, UserId)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| *entry.key())
            .collect();
        keys.into_iter()
            .filter(|(conversation_id, user_id)| self.stop_typing(*conversation_id, *user_id))
            .count()
    }

    pub fn run_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = self.sweep();
                if expired > 0 {
                    tracing::debug!(expired, "typing indicators expired");
                }
            }
        })
    }
}
