//! 在线状态用例服务
//!
//! 会话登记（connect / disconnect / ping）、显式状态设置、隐私过滤
//! 查询、活动信号落库，以及状态变化的受众计算与推送。所有写路径
//! 最终都汇聚到 [`PresenceService::recompute`]，广播只在聚合状态
//! 真正发生变化时触发一次。

use std::collections::HashSet;
use std::sync::Arc;

use domain::{
    resolve_status, DeviceType, OnlineStatus, PresenceView, Session, SocketId, StatusMessage,
    UserId, UserPresence,
};

use crate::{
    broadcaster::{OnlineViewRegistry, PresenceBroadcaster, PresenceEvent},
    clock::Clock,
    error::ApplicationError,
    rate_limiter::ActivityThrottle,
    repository::{ConversationRepository, Pagination, PresenceRepository, SessionRepository},
};

/// 显式状态设置请求（已在边界完成校验）。
#[derive(Debug, Clone)]
pub struct SetStatusRequest {
    pub user_id: UserId,
    pub status: OnlineStatus,
    pub message: Option<StatusMessage>,
}

pub struct PresenceServiceDependencies {
    pub session_repository: Arc<dyn SessionRepository>,
    pub presence_repository: Arc<dyn PresenceRepository>,
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub broadcaster: Arc<dyn PresenceBroadcaster>,
    pub online_view: Arc<OnlineViewRegistry>,
    pub clock: Arc<dyn Clock>,
    pub throttle: Arc<ActivityThrottle>,
}

pub struct PresenceService {
    deps: PresenceServiceDependencies,
}

impl PresenceService {
    pub fn new(deps: PresenceServiceDependencies) -> Self {
        Self { deps }
    }

    /// 新连接（或同一 socket 的重连）登记，随后重算聚合状态。
    pub async fn connect(
        &self,
        user_id: UserId,
        socket_id: SocketId,
        device_type: Option<DeviceType>,
    ) -> Result<Session, ApplicationError> {
        let now = self.deps.clock.now();
        let session = self
            .deps
            .session_repository
            .upsert_connected(user_id, &socket_id, device_type, now)
            .await?;

        tracing::info!(
            user_id = %user_id,
            socket_id = %socket_id,
            device = ?device_type,
            "会话连接"
        );

        self.recompute(user_id).await?;
        Ok(session)
    }

    /// 显式断开。会话缺失或已不活跃时静默返回：断开事件可能与
    /// 清扫任务过期同一会话的操作竞争，这不是错误。
    pub async fn disconnect(
        &self,
        user_id: UserId,
        socket_id: SocketId,
    ) -> Result<(), ApplicationError> {
        let closed = self
            .deps
            .session_repository
            .deactivate(user_id, &socket_id)
            .await?;

        if closed.is_some() {
            tracing::info!(user_id = %user_id, socket_id = %socket_id, "会话断开");
            self.recompute(user_id).await?;
        }

        Ok(())
    }

    /// 活动信号。被动信号经过节流窗口折叠；显式信号无条件落库。
    pub async fn record_activity(
        &self,
        user_id: UserId,
        explicit: bool,
    ) -> Result<(), ApplicationError> {
        if explicit {
            self.deps.throttle.record_explicit(user_id);
        } else if !self.deps.throttle.should_write(user_id) {
            return Ok(());
        }

        let now = self.deps.clock.now();
        self.deps
            .session_repository
            .touch_active(user_id, now)
            .await?;
        self.deps
            .presence_repository
            .update_last_activity(user_id, now)
            .await?;
        Ok(())
    }

    /// 被动活动信号的旁路入口：presence 是尽力而为的副作用，
    /// 失败时记录日志并继续，绝不让宿主操作失败。
    pub async fn note_activity(&self, user_id: UserId) {
        if let Err(err) = self.record_activity(user_id, false).await {
            tracing::warn!(user_id = %user_id, error = %err, "activity write failed");
        }
    }

    /// 显式状态设置。away/dnd 作为手动覆盖原样存储；online/offline
    /// 会清除覆盖并按当前会话数重新推导。重复提交相同载荷不会
    /// 触发第二次广播。
    pub async fn set_status(
        &self,
        request: SetStatusRequest,
    ) -> Result<PresenceView, ApplicationError> {
        let SetStatusRequest {
            user_id,
            status,
            message,
        } = request;

        let presence = self.require(user_id).await?;
        let now = self.deps.clock.now();

        let target = if status.is_manual_override() {
            status
        } else {
            // 显式 online/offline 都回到由会话数推导的状态
            let active = self.deps.session_repository.count_active(user_id).await?;
            resolve_status(OnlineStatus::Offline, active)
        };

        let status_changed = target != presence.online_status;
        let message_changed = match &message {
            Some(new) => presence.custom_status_message.as_ref() != Some(new),
            None => false,
        };

        if let Some(new_message) = message.clone() {
            if message_changed {
                self.deps
                    .presence_repository
                    .update_status_message(user_id, Some(new_message))
                    .await?;
            }
        }

        if status_changed {
            self.deps
                .presence_repository
                .update_status(user_id, target)
                .await?;
        }

        // 设置状态本身就是一次用户活动
        self.deps
            .presence_repository
            .update_last_activity(user_id, now)
            .await?;

        let updated = self.require(user_id).await?;

        if status_changed || message_changed {
            tracing::info!(user_id = %user_id, status = %target, "显式状态变更");
            self.publish_change(&updated).await;
        }

        Ok(PresenceView::project(&updated, Some(user_id), now))
    }

    /// 单用户查询：返回以 viewer 视角过滤后的投影。
    pub async fn get_presence(
        &self,
        target: UserId,
        viewer: Option<UserId>,
    ) -> Result<PresenceView, ApplicationError> {
        let presence = self.require(target).await?;
        let now = self.deps.clock.now();
        Ok(PresenceView::project(&presence, viewer, now))
    }

    pub async fn get_visibility(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        let presence = self.require(user_id).await?;
        Ok(presence.show_online_status)
    }

    pub async fn update_visibility(
        &self,
        user_id: UserId,
        show_online_status: bool,
    ) -> Result<(), ApplicationError> {
        self.require(user_id).await?;
        self.deps
            .presence_repository
            .update_visibility(user_id, show_online_status)
            .await?;
        Ok(())
    }

    /// 在线用户列表，逐个应用隐私过滤。
    pub async fn list_online(
        &self,
        viewer: Option<UserId>,
        page: Pagination,
    ) -> Result<Vec<PresenceView>, ApplicationError> {
        let now = self.deps.clock.now();
        let online = self.deps.presence_repository.list_online(page).await?;
        Ok(online
            .iter()
            .map(|presence| PresenceView::project(presence, viewer, now))
            .collect())
    }

    /// 正在输入指示：只转发给会话对端，不落库。
    pub async fn typing(
        &self,
        from: UserId,
        to: UserId,
        is_typing: bool,
    ) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();
        let event = PresenceEvent::user_typing(from, is_typing, now);
        self.deps.broadcaster.send(to, event).await?;
        Ok(())
    }

    /// 重算聚合状态并在值变化时持久化、广播。幂等：没有状态变化
    /// 时不写不播。由 connect / disconnect / 清扫任务共用。
    pub async fn recompute(&self, user_id: UserId) -> Result<(), ApplicationError> {
        let Some(presence) = self.deps.presence_repository.find(user_id).await? else {
            tracing::warn!(user_id = %user_id, "presence recompute for unknown user");
            return Ok(());
        };

        let active = self.deps.session_repository.count_active(user_id).await?;
        let resolved = resolve_status(presence.online_status, active);

        if resolved == presence.online_status {
            return Ok(());
        }

        if resolved == OnlineStatus::Offline {
            // "最后在线"取最后一条会话的最终心跳，而不是扫描时刻
            if let Some(last_ping) = self.deps.session_repository.latest_ping(user_id).await? {
                self.deps
                    .presence_repository
                    .update_last_activity(user_id, last_ping)
                    .await?;
            }
        }

        self.deps
            .presence_repository
            .update_status(user_id, resolved)
            .await?;

        tracing::debug!(
            user_id = %user_id,
            from = %presence.online_status,
            to = %resolved,
            active_sessions = active,
            "聚合状态变化"
        );

        if let Some(updated) = self.deps.presence_repository.find(user_id).await? {
            self.publish_change(&updated).await;
        }

        Ok(())
    }

    /// 广播协调：受众 = 会话对端 ∪ 在线视图订阅者。每个接收者
    /// 拿到以自己为 viewer 过滤后的投影，绝不携带超出其直接查询
    /// 权限的信息。投递失败只记日志。
    async fn publish_change(&self, presence: &UserPresence) {
        let now = self.deps.clock.now();

        let mut audience: HashSet<UserId> = match self
            .deps
            .conversation_repository
            .partners_of(presence.user_id)
            .await
        {
            Ok(partners) => partners.into_iter().collect(),
            Err(err) => {
                tracing::warn!(
                    user_id = %presence.user_id,
                    error = %err,
                    "audience lookup failed"
                );
                HashSet::new()
            }
        };
        audience.extend(self.deps.online_view.subscribers());
        audience.remove(&presence.user_id);

        for recipient in audience {
            let view = PresenceView::project(presence, Some(recipient), now);
            let event = PresenceEvent::presence_update(&view, now);
            if let Err(err) = self.deps.broadcaster.send(recipient, event).await {
                tracing::warn!(
                    recipient = %recipient,
                    error = %err,
                    "presence event delivery failed"
                );
            }
        }
    }

    async fn require(&self, user_id: UserId) -> Result<UserPresence, ApplicationError> {
        self.deps
            .presence_repository
            .find(user_id)
            .await?
            .ok_or(ApplicationError::Domain(domain::DomainError::UserNotFound))
    }
}
