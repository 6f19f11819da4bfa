//! 不活跃会话清扫任务
//!
//! 按固定间隔扫描心跳超过阈值的活跃会话，批量置为不活跃，并为每个
//! 受影响用户走一遍常规的重算/广播路径。过期谓词在存储层写入时
//! 重新检查，因此与并发的 connect / disconnect 互不干扰：扫描之后
//! 才重连的会话不会进入更新集合，随后的重算反映的就是当前现实。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::PresenceConfig;

use crate::{
    clock::Clock, error::ApplicationError, repository::SessionRepository,
    services::PresenceService,
};

/// 每多少轮清扫顺带执行一次留存清理。
const PURGE_EVERY_N_SWEEPS: u64 = 10;

pub struct InactivitySweeper {
    service: Arc<PresenceService>,
    session_repository: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    /// 再入保护：上一轮还在执行时跳过本轮
    in_flight: AtomicBool,
    runs: AtomicU64,
}

impl InactivitySweeper {
    pub fn new(
        service: Arc<PresenceService>,
        session_repository: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            service,
            session_repository,
            clock,
            config,
            in_flight: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// 执行一轮清扫，返回受影响的用户数。上一轮未结束时直接跳过。
    pub async fn run_once(&self) -> Result<usize, ApplicationError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::warn!("sweep skipped: previous run still in flight");
            return Ok(0);
        }

        let result = self.sweep().await;
        self.in_flight.store(false, Ordering::Release);
        result
    }

    async fn sweep(&self) -> Result<usize, ApplicationError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::seconds(self.config.inactivity_threshold_secs as i64);

        let affected = self.session_repository.expire_stale(cutoff).await?;

        if !affected.is_empty() {
            tracing::info!(users = affected.len(), "清扫过期会话");
        }

        for user_id in &affected {
            // 单个用户的重算失败不中断整轮清扫
            if let Err(err) = self.service.recompute(*user_id).await {
                tracing::error!(user_id = %user_id, error = %err, "recompute after sweep failed");
            }
        }

        let runs = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        if runs % PURGE_EVERY_N_SWEEPS == 0 {
            let retention_cutoff =
                now - chrono::Duration::days(self.config.session_retention_days);
            match self
                .session_repository
                .purge_inactive_before(retention_cutoff)
                .await
            {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "清理留存期外的会话记录");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "session retention purge failed");
                }
            }
        }

        Ok(affected.len())
    }

    /// 启动周期性清扫任务。
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过它让任务从一个完整间隔后开始
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    tracing::error!(error = %err, "presence sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::OnlineViewRegistry;
    use crate::memory::{
        MemoryConversationRepository, MemoryPresenceRepository, MemorySessionRepository,
    };
    use crate::rate_limiter::ActivityThrottle;
    use crate::repository::PresenceRepository;
    use crate::services::PresenceServiceDependencies;
    use crate::{LocalPresenceBroadcaster, SystemClock};
    use chrono::{Duration as ChronoDuration, Utc};
    use domain::{DeviceType, OnlineStatus, SocketId, UserId, UserPresence};
    use uuid::Uuid;

    struct Fixture {
        sweeper: Arc<InactivitySweeper>,
        service: Arc<PresenceService>,
        sessions: Arc<MemorySessionRepository>,
        presence: Arc<MemoryPresenceRepository>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(MemorySessionRepository::new());
        let presence = Arc::new(MemoryPresenceRepository::new());
        let conversations = Arc::new(MemoryConversationRepository::new());
        let broadcaster = Arc::new(LocalPresenceBroadcaster::new());
        let online_view = Arc::new(OnlineViewRegistry::new());
        let clock = Arc::new(SystemClock);

        let service = Arc::new(PresenceService::new(PresenceServiceDependencies {
            session_repository: sessions.clone(),
            presence_repository: presence.clone(),
            conversation_repository: conversations,
            broadcaster,
            online_view,
            clock: clock.clone(),
            throttle: Arc::new(ActivityThrottle::default()),
        }));

        let sweeper = Arc::new(InactivitySweeper::new(
            service.clone(),
            sessions.clone(),
            clock,
            config::PresenceConfig::default(),
        ));

        Fixture {
            sweeper,
            service,
            sessions,
            presence,
        }
    }

    async fn connected_user(fx: &Fixture, socket: &SocketId) -> UserId {
        let user_id = UserId::from(Uuid::new_v4());
        fx.presence.insert(UserPresence::initial(user_id)).await;
        fx.service
            .connect(user_id, socket.clone(), Some(DeviceType::Web))
            .await
            .unwrap();
        user_id
    }

    #[tokio::test]
    async fn sweep_expires_stale_session_and_sets_offline() {
        let fx = fixture();
        let socket = SocketId::generate();
        let user_id = connected_user(&fx, &socket).await;

        let stale_ping = Utc::now() - ChronoDuration::minutes(15);
        fx.sessions.set_last_ping(&socket, stale_ping).await;

        let affected = fx.sweeper.run_once().await.unwrap();
        assert_eq!(affected, 1);

        let presence = fx.presence.find(user_id).await.unwrap().unwrap();
        assert_eq!(presence.online_status, OnlineStatus::Offline);
        // "最后在线"等于过期会话的最终心跳，而非扫描时刻
        assert_eq!(presence.last_activity, Some(stale_ping));
    }

    #[tokio::test]
    async fn sweep_keeps_user_online_while_another_session_is_fresh() {
        let fx = fixture();
        let stale_socket = SocketId::generate();
        let user_id = connected_user(&fx, &stale_socket).await;

        let fresh_socket = SocketId::generate();
        fx.service
            .connect(user_id, fresh_socket.clone(), Some(DeviceType::Mobile))
            .await
            .unwrap();

        fx.sessions
            .set_last_ping(&stale_socket, Utc::now() - ChronoDuration::minutes(15))
            .await;

        fx.sweeper.run_once().await.unwrap();

        let stale = fx.sessions.find_by_socket(&stale_socket).await.unwrap();
        assert!(!stale.is_active);

        let presence = fx.presence.find(user_id).await.unwrap().unwrap();
        assert_eq!(presence.online_status, OnlineStatus::Online);
    }

    #[tokio::test]
    async fn sweep_without_stale_sessions_is_a_noop() {
        let fx = fixture();
        let socket = SocketId::generate();
        let user_id = connected_user(&fx, &socket).await;

        let affected = fx.sweeper.run_once().await.unwrap();
        assert_eq!(affected, 0);

        let presence = fx.presence.find(user_id).await.unwrap().unwrap();
        assert_eq!(presence.online_status, OnlineStatus::Online);
    }

    #[tokio::test]
    async fn sweep_does_not_clear_manual_override() {
        let fx = fixture();
        let socket = SocketId::generate();
        let user_id = connected_user(&fx, &socket).await;

        fx.service
            .set_status(crate::services::SetStatusRequest {
                user_id,
                status: OnlineStatus::Dnd,
                message: None,
            })
            .await
            .unwrap();

        fx.sessions
            .set_last_ping(&socket, Utc::now() - ChronoDuration::minutes(15))
            .await;
        fx.sweeper.run_once().await.unwrap();

        // 手动 dnd 在全部会话过期后仍然有效
        let presence = fx.presence.find(user_id).await.unwrap().unwrap();
        assert_eq!(presence.online_status, OnlineStatus::Dnd);
    }
}
