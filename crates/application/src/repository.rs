//! 存储端口定义
//!
//! 所有组件只通过这几个端口与共享存储交互；Postgres 实现位于
//! infrastructure crate，内存实现（见 [`crate::memory`]）用于测试。

use async_trait::async_trait;
use domain::{
    DeviceType, OnlineStatus, RepositoryError, Session, SocketId, StatusMessage, Timestamp,
    UserId, UserPresence,
};

/// 分页参数。
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// 会话登记存储端口。
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// 按 `socket_id` 原子 upsert：已存在则刷新时间戳并重新激活，
    /// 不存在则新建。重复 connect 语义上是重连而非重复登记。
    async fn upsert_connected(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
        device_type: Option<DeviceType>,
        now: Timestamp,
    ) -> Result<Session, RepositoryError>;

    /// 将匹配的活跃会话标记为不活跃，返回关闭前的会话记录。
    /// 会话不存在或已不活跃时返回 `None`（与清扫任务竞争属正常情况）。
    async fn deactivate(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
    ) -> Result<Option<Session>, RepositoryError>;

    /// 刷新该用户所有活跃会话的 `last_ping`，返回受影响行数。
    async fn touch_active(
        &self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<u64, RepositoryError>;

    /// 该用户当前活跃会话数量。
    async fn count_active(&self, user_id: UserId) -> Result<i64, RepositoryError>;

    /// 该用户所有会话（含已关闭）中最新的 `last_ping`。
    /// 离线转换时用它回填 `last_activity`，而不是用扫描时刻。
    async fn latest_ping(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError>;

    /// 批量将 `last_ping` 早于 cutoff 的活跃会话置为不活跃，
    /// 返回受影响的去重用户列表。谓词在写入时重新检查 `is_active`，
    /// 因此并发重连的会话不会被错误降级。
    async fn expire_stale(&self, cutoff: Timestamp) -> Result<Vec<UserId>, RepositoryError>;

    /// 留存清理：删除早于 cutoff 的不活跃会话行，返回删除数量。
    async fn purge_inactive_before(&self, cutoff: Timestamp) -> Result<u64, RepositoryError>;
}

/// 用户在线状态存储端口（users 表的 presence 投影）。
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn find(&self, user_id: UserId) -> Result<Option<UserPresence>, RepositoryError>;

    async fn update_status(
        &self,
        user_id: UserId,
        status: OnlineStatus,
    ) -> Result<(), RepositoryError>;

    async fn update_status_message(
        &self,
        user_id: UserId,
        message: Option<StatusMessage>,
    ) -> Result<(), RepositoryError>;

    async fn update_visibility(
        &self,
        user_id: UserId,
        show_online_status: bool,
    ) -> Result<(), RepositoryError>;

    async fn update_last_activity(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;

    /// 在线用户列表：只返回状态可见且处于 online/away 的用户。
    async fn list_online(&self, page: Pagination) -> Result<Vec<UserPresence>, RepositoryError>;
}

/// 会话关系端口：广播协调器用它确定关注某个用户状态的受众。
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 与给定用户存在活跃会话关系的对端用户列表。
    async fn partners_of(&self, user_id: UserId) -> Result<Vec<UserId>, RepositoryError>;
}
