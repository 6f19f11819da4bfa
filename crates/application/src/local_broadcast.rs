// 单进程内的本地推送实现
use crate::broadcaster::{BroadcastError, ConnectionId, PresenceBroadcaster, PresenceEvent};
use async_trait::async_trait;
use domain::UserId;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 本地推送器：维护 用户 -> 活跃连接发送端 的注册表。
///
/// WebSocket 连接建立时注册一个 mpsc 发送端，断开时注销；
/// `send` 把事件克隆投递到该用户的每个连接。没有连接时静默落空。
#[derive(Default)]
pub struct LocalPresenceBroadcaster {
    connections: RwLock<HashMap<UserId, HashMap<ConnectionId, mpsc::UnboundedSender<PresenceEvent>>>>,
}

impl LocalPresenceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一条新连接注册接收通道，返回连接标识和事件接收端。
    pub fn register(
        &self,
        user_id: UserId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();

        if let Ok(mut connections) = self.connections.write() {
            connections
                .entry(user_id)
                .or_default()
                .insert(connection_id, tx);
        }

        (connection_id, rx)
    }

    /// 连接断开时注销发送端。
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        if let Ok(mut connections) = self.connections.write() {
            if let Some(senders) = connections.get_mut(&user_id) {
                senders.remove(&connection_id);
                if senders.is_empty() {
                    connections.remove(&user_id);
                }
            }
        }
    }

    /// 某用户当前注册的连接数（用于测试和观测）。
    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.connections
            .read()
            .ok()
            .and_then(|c| c.get(&user_id).map(|s| s.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl PresenceBroadcaster for LocalPresenceBroadcaster {
    async fn send(&self, user_id: UserId, event: PresenceEvent) -> Result<(), BroadcastError> {
        let mut dead = Vec::new();

        if let Ok(connections) = self.connections.read() {
            if let Some(senders) = connections.get(&user_id) {
                for (connection_id, sender) in senders {
                    if sender.send(event.clone()).is_err() {
                        dead.push(*connection_id);
                    }
                }
            }
        }

        // 接收端已消失的连接顺手清掉
        for connection_id in dead {
            self.unregister(user_id, connection_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn delivers_to_every_connection_of_the_user() {
        let broadcaster = LocalPresenceBroadcaster::new();
        let user_id = UserId::from(Uuid::new_v4());

        let (_id_a, mut rx_a) = broadcaster.register(user_id);
        let (_id_b, mut rx_b) = broadcaster.register(user_id);

        let event = PresenceEvent::user_typing(user_id, true, Utc::now());
        broadcaster.send(user_id, event).await.unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_a_noop() {
        let broadcaster = LocalPresenceBroadcaster::new();
        let user_id = UserId::from(Uuid::new_v4());

        let event = PresenceEvent::user_typing(user_id, false, Utc::now());
        assert!(broadcaster.send(user_id, event).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_send() {
        let broadcaster = LocalPresenceBroadcaster::new();
        let user_id = UserId::from(Uuid::new_v4());

        let (_id, rx) = broadcaster.register(user_id);
        drop(rx);
        assert_eq!(broadcaster.connection_count(user_id), 1);

        let event = PresenceEvent::user_typing(user_id, true, Utc::now());
        broadcaster.send(user_id, event).await.unwrap();
        assert_eq!(broadcaster.connection_count(user_id), 0);
    }

    #[tokio::test]
    async fn unregister_removes_connection() {
        let broadcaster = LocalPresenceBroadcaster::new();
        let user_id = UserId::from(Uuid::new_v4());

        let (id, _rx) = broadcaster.register(user_id);
        assert_eq!(broadcaster.connection_count(user_id), 1);

        broadcaster.unregister(user_id, id);
        assert_eq!(broadcaster.connection_count(user_id), 0);
    }
}
