//! 会话实体
//!
//! 一条会话对应一个用户的一条活跃设备连接（socket）。同一个用户
//! 可以同时持有多条会话；`socket_id` 在任意时刻至多对应一条活跃会话。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{SessionId, SocketId, Timestamp, UserId};

/// 连接设备类型（仅作元数据，不参与状态推导）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Web,
    Mobile,
    Desktop,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Web => "web",
            DeviceType::Mobile => "mobile",
            DeviceType::Desktop => "desktop",
        }
    }
}

impl FromStr for DeviceType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "web" => Ok(DeviceType::Web),
            "mobile" => Ok(DeviceType::Mobile),
            "desktop" => Ok(DeviceType::Desktop),
            other => Err(DomainError::UnknownDeviceType {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub socket_id: SocketId,
    pub device_type: Option<DeviceType>,
    pub connected_at: Timestamp,
    pub last_ping: Timestamp,
    pub is_active: bool,
}

impl Session {
    /// 建立新连接时创建会话。
    pub fn open(
        user_id: UserId,
        socket_id: SocketId,
        device_type: Option<DeviceType>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            user_id,
            socket_id,
            device_type,
            connected_at: now,
            last_ping: now,
            is_active: true,
        }
    }

    /// 同一 socket 重连：刷新时间戳并重新激活，视作更新而非新建。
    pub fn reconnect(&mut self, device_type: Option<DeviceType>, now: Timestamp) {
        self.device_type = device_type;
        self.connected_at = now;
        self.last_ping = now;
        self.is_active = true;
    }

    /// 收到活动信号时刷新心跳时间。
    pub fn touch(&mut self, now: Timestamp) {
        self.last_ping = now;
    }

    /// 显式断开或被清扫任务过期。
    pub fn close(&mut self) {
        self.is_active = false;
    }

    /// 活跃会话的心跳是否早于给定阈值时间点。
    pub fn is_stale(&self, cutoff: Timestamp) -> bool {
        self.is_active && self.last_ping < cutoff
    }
}
