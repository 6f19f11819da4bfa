//! 内存存储实现（用于测试和本地开发）
//!
//! 与 Postgres 实现遵守完全相同的端口语义，包括 upsert 的重连
//! 行为和清扫谓词在写入时重查 `is_active`。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{
    DeviceType, OnlineStatus, RepositoryError, Session, SocketId, StatusMessage, Timestamp,
    UserId, UserPresence,
};
use tokio::sync::RwLock;

use crate::repository::{
    ConversationRepository, Pagination, PresenceRepository, SessionRepository,
};

#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<SocketId, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接读取某个会话（测试断言用）。
    pub async fn find_by_socket(&self, socket_id: &SocketId) -> Option<Session> {
        self.sessions.read().await.get(socket_id).cloned()
    }

    /// 测试注入：覆盖某个会话的心跳时间。
    pub async fn set_last_ping(&self, socket_id: &SocketId, at: Timestamp) {
        if let Some(session) = self.sessions.write().await.get_mut(socket_id) {
            session.last_ping = at;
        }
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn upsert_connected(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
        device_type: Option<DeviceType>,
        now: Timestamp,
    ) -> Result<Session, RepositoryError> {
        let mut sessions = self.sessions.write().await;

        let session = match sessions.get_mut(socket_id) {
            Some(existing) => {
                existing.user_id = user_id;
                existing.reconnect(device_type, now);
                existing.clone()
            }
            None => {
                let session = Session::open(user_id, socket_id.clone(), device_type, now);
                sessions.insert(socket_id.clone(), session.clone());
                session
            }
        };

        Ok(session)
    }

    async fn deactivate(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
    ) -> Result<Option<Session>, RepositoryError> {
        let mut sessions = self.sessions.write().await;

        match sessions.get_mut(socket_id) {
            Some(session) if session.user_id == user_id && session.is_active => {
                session.close();
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn touch_active(
        &self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let mut touched = 0;

        for session in sessions.values_mut() {
            if session.user_id == user_id && session.is_active {
                session.touch(now);
                touched += 1;
            }
        }

        Ok(touched)
    }

    async fn count_active(&self, user_id: UserId) -> Result<i64, RepositoryError> {
        let sessions = self.sessions.read().await;
        let count = sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .count();
        Ok(count as i64)
    }

    async fn latest_ping(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
        let sessions = self.sessions.read().await;
        let latest = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.last_ping)
            .max();
        Ok(latest)
    }

    async fn expire_stale(&self, cutoff: Timestamp) -> Result<Vec<UserId>, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let mut affected = HashSet::new();

        for session in sessions.values_mut() {
            if session.is_stale(cutoff) {
                session.close();
                affected.insert(session.user_id);
            }
        }

        Ok(affected.into_iter().collect())
    }

    async fn purge_inactive_before(&self, cutoff: Timestamp) -> Result<u64, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.is_active || s.last_ping >= cutoff);
        Ok((before - sessions.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryPresenceRepository {
    users: RwLock<HashMap<UserId, UserPresence>>,
}

impl MemoryPresenceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一个用户（测试用，生产路径里用户由外部协作者创建）。
    pub async fn insert(&self, presence: UserPresence) {
        self.users.write().await.insert(presence.user_id, presence);
    }
}

#[async_trait]
impl PresenceRepository for MemoryPresenceRepository {
    async fn find(&self, user_id: UserId) -> Result<Option<UserPresence>, RepositoryError> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn update_status(
        &self,
        user_id: UserId,
        status: OnlineStatus,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let presence = users.get_mut(&user_id).ok_or(RepositoryError::NotFound)?;
        presence.online_status = status;
        Ok(())
    }

    async fn update_status_message(
        &self,
        user_id: UserId,
        message: Option<StatusMessage>,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let presence = users.get_mut(&user_id).ok_or(RepositoryError::NotFound)?;
        presence.custom_status_message = message;
        Ok(())
    }

    async fn update_visibility(
        &self,
        user_id: UserId,
        show_online_status: bool,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let presence = users.get_mut(&user_id).ok_or(RepositoryError::NotFound)?;
        presence.show_online_status = show_online_status;
        Ok(())
    }

    async fn update_last_activity(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let presence = users.get_mut(&user_id).ok_or(RepositoryError::NotFound)?;
        presence.last_activity = Some(at);
        Ok(())
    }

    async fn list_online(&self, page: Pagination) -> Result<Vec<UserPresence>, RepositoryError> {
        let users = self.users.read().await;
        let mut online: Vec<UserPresence> = users
            .values()
            .filter(|p| {
                p.show_online_status
                    && matches!(p.online_status, OnlineStatus::Online | OnlineStatus::Away)
            })
            .cloned()
            .collect();

        // 与 SQL 实现一致：最近活跃的排在前面
        online.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        let offset = page.offset.max(0) as usize;
        let limit = page.limit.max(0) as usize;
        Ok(online.into_iter().skip(offset).take(limit).collect())
    }
}

#[derive(Default)]
pub struct MemoryConversationRepository {
    partners: RwLock<HashMap<UserId, HashSet<UserId>>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立一条双向会话关系。
    pub async fn link(&self, a: UserId, b: UserId) {
        let mut partners = self.partners.write().await;
        partners.entry(a).or_default().insert(b);
        partners.entry(b).or_default().insert(a);
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn partners_of(&self, user_id: UserId) -> Result<Vec<UserId>, RepositoryError> {
        let partners = self.partners.read().await;
        Ok(partners
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}
