use std::collections::HashSet;

use dashmap::DashMap;
use domain::{ConnectionId, UserId};

/// 在线状态追踪
///
/// 按用户分片加锁的并发表：用户 -> 当前存活的连接集合。
/// 集合为空即离线，空集合不会留在表里。状态只在本进程内有效，
/// 进程重启后由客户端重连重新登记。
#[derive(Default)]
pub struct PresenceTracker {
    connections: DashMap<UserId, HashSet<ConnectionId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记连接，返回该用户是否因此由离线变为在线
    pub fn add_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut entry = self.connections.entry(user_id).or_default();
        let came_online = entry.is_empty();
        entry.insert(connection_id);
        came_online
    }

    /// 注销连接，返回该用户是否因此变为离线
    pub fn remove_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        // 在同一把分片锁内完成删除与判空
        self.connections
            .remove_if_mut(&user_id, |_, set| {
                set.remove(&connection_id);
                set.is_empty()
            })
            .is_some()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections
            .get(&user_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn connections_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.connections
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
