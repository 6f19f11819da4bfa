//! 实时推送端口
//!
//! 广播协调器通过 [`PresenceBroadcaster`] 把事件投递到某个用户的
//! 全部活跃连接；用户没有连接时投递静默落空。事件载荷里只携带
//! 经过隐私过滤后该接收者有权看到的内容。

use async_trait::async_trait;
use domain::{PresenceView, Timestamp, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// 连接句柄标识，用于注销时定位某一条具体连接。
pub type ConnectionId = Uuid;

/// 传输层事件。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PresenceEvent {
    /// 某个用户的在线状态发生变化（已按接收者做隐私过滤）。
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        user_id: UserId,
        status: domain::OnlineStatus,
        custom_message: Option<String>,
        last_seen_text: String,
        timestamp: Timestamp,
    },
    /// 正在输入指示，不落库，仅在会话双方之间转发。
    #[serde(rename_all = "camelCase")]
    UserTyping {
        user_id: UserId,
        is_typing: bool,
        timestamp: Timestamp,
    },
}

impl PresenceEvent {
    /// 从隐私投影构造状态变化事件。
    pub fn presence_update(view: &PresenceView, now: Timestamp) -> Self {
        Self::PresenceUpdate {
            user_id: view.user_id,
            status: view.online_status,
            custom_message: view.custom_message.as_ref().map(|m| m.as_str().to_string()),
            last_seen_text: view.last_seen_text.clone(),
            timestamp: now,
        }
    }

    pub fn user_typing(user_id: UserId, is_typing: bool, now: Timestamp) -> Self {
        Self::UserTyping {
            user_id,
            is_typing,
            timestamp: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait PresenceBroadcaster: Send + Sync {
    /// 向指定用户的所有活跃连接投递事件，尽力而为。
    async fn send(&self, user_id: UserId, event: PresenceEvent) -> Result<(), BroadcastError>;
}

/// "谁在线"视图的订阅登记。
///
/// 正在渲染在线用户列表的客户端会订阅状态变化；订阅按具体连接
/// 记账，同一用户的多条连接互不影响，连接断开时由传输层退订
/// 自己那一条。
#[derive(Debug, Default)]
pub struct OnlineViewRegistry {
    subscriptions: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
}

impl OnlineViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: UserId, connection_id: ConnectionId) {
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            subscriptions.entry(user_id).or_default().insert(connection_id);
        }
    }

    pub fn unsubscribe(&self, user_id: UserId, connection_id: ConnectionId) {
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            if let Some(connections) = subscriptions.get_mut(&user_id) {
                connections.remove(&connection_id);
                if connections.is_empty() {
                    subscriptions.remove(&user_id);
                }
            }
        }
    }

    /// 至少持有一条订阅连接的用户列表。
    pub fn subscribers(&self) -> Vec<UserId> {
        self.subscriptions
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_subscribe_unsubscribe() {
        let registry = OnlineViewRegistry::new();
        let user_id = UserId::from(Uuid::new_v4());
        let connection_id = Uuid::new_v4();

        registry.subscribe(user_id, connection_id);
        registry.subscribe(user_id, connection_id);
        assert_eq!(registry.subscribers(), vec![user_id]);

        registry.unsubscribe(user_id, connection_id);
        assert!(registry.subscribers().is_empty());
    }

    #[test]
    fn closing_one_connection_keeps_the_other_subscription() {
        let registry = OnlineViewRegistry::new();
        let user_id = UserId::from(Uuid::new_v4());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.subscribe(user_id, first);
        registry.subscribe(user_id, second);

        // 同一用户另一条连接的订阅不受影响
        registry.unsubscribe(user_id, first);
        assert_eq!(registry.subscribers(), vec![user_id]);

        registry.unsubscribe(user_id, second);
        assert!(registry.subscribers().is_empty());
    }
}
