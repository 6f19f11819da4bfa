//! 应用层实现。
//!
//! 这里提供围绕在线状态领域模型的用例服务：会话登记、状态推导与
//! 广播、活动信号限流、不活跃会话清扫，以及对外部适配器
//! （存储、实时推送）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod local_broadcast;
pub mod memory;
pub mod rate_limiter;
pub mod repository;
pub mod services;
pub mod sweeper;

pub use broadcaster::{
    BroadcastError, ConnectionId, OnlineViewRegistry, PresenceBroadcaster, PresenceEvent,
};
pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use local_broadcast::LocalPresenceBroadcaster;
pub use memory::{
    MemoryConversationRepository, MemoryPresenceRepository, MemorySessionRepository,
};
pub use rate_limiter::ActivityThrottle;
pub use repository::{
    ConversationRepository, Pagination, PresenceRepository, SessionRepository,
};
pub use services::{PresenceService, PresenceServiceDependencies, SetStatusRequest};
pub use sweeper::InactivitySweeper;
