//! 在线状态模型
//!
//! 包含状态机（online / away / dnd / offline）、聚合状态推导规则、
//! 以及面向查看者的隐私投影。推导和投影都是纯函数，便于穷举测试。

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{StatusMessage, Timestamp, UserId};

/// 用户聚合在线状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
    Away,
    Dnd,
}

impl OnlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::Online => "online",
            OnlineStatus::Offline => "offline",
            OnlineStatus::Away => "away",
            OnlineStatus::Dnd => "dnd",
        }
    }

    /// 手动设置的 away/dnd 优先于连接推导出的状态。
    pub fn is_manual_override(&self) -> bool {
        matches!(self, OnlineStatus::Away | OnlineStatus::Dnd)
    }
}

impl FromStr for OnlineStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(OnlineStatus::Online),
            "offline" => Ok(OnlineStatus::Offline),
            "away" => Ok(OnlineStatus::Away),
            "dnd" => Ok(OnlineStatus::Dnd),
            other => Err(DomainError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户的在线状态投影（users 表中与 presence 相关的列）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub online_status: OnlineStatus,
    pub show_online_status: bool,
    pub custom_status_message: Option<StatusMessage>,
    pub last_activity: Option<Timestamp>,
}

impl UserPresence {
    /// 新用户的初始状态：离线、状态可见。
    pub fn initial(user_id: UserId) -> Self {
        Self {
            user_id,
            online_status: OnlineStatus::Offline,
            show_online_status: true,
            custom_status_message: None,
            last_activity: None,
        }
    }
}

/// 由会话数量和当前存储状态推导聚合在线状态。
///
/// 优先级从高到低：
/// 1. 手动设置的 away/dnd 一直有效，不受会话数量影响；
/// 2. 存在活跃会话即为 online；
/// 3. 否则为 offline。
pub fn resolve_status(stored: OnlineStatus, active_sessions: i64) -> OnlineStatus {
    if stored.is_manual_override() {
        return stored;
    }
    if active_sessions > 0 {
        OnlineStatus::Online
    } else {
        OnlineStatus::Offline
    }
}

/// 面向某个查看者的 presence 投影。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceView {
    pub user_id: UserId,
    pub online_status: OnlineStatus,
    pub custom_message: Option<StatusMessage>,
    pub last_seen: Option<Timestamp>,
    pub last_seen_text: String,
    pub show_status: bool,
}

impl PresenceView {
    /// 按隐私规则把真实状态映射为查看者可见的投影。
    ///
    /// 规则按顺序评估：
    /// 1. 查看者是本人：返回完整真实状态；
    /// 2. 用户关闭了在线状态展示：对外恒为 offline，不泄露时间戳；
    /// 3. dnd 对第三方与规则 2 的投影完全一致（本人仍可见 dnd）；
    /// 4. 其余情况返回真实状态和人性化的 last seen 文本。
    pub fn project(presence: &UserPresence, viewer: Option<UserId>, now: Timestamp) -> Self {
        if viewer == Some(presence.user_id) {
            return Self {
                user_id: presence.user_id,
                online_status: presence.online_status,
                custom_message: presence.custom_status_message.clone(),
                last_seen: presence.last_activity,
                last_seen_text: last_seen_text(
                    presence.online_status,
                    presence.last_activity,
                    now,
                ),
                show_status: presence.show_online_status,
            };
        }

        if !presence.show_online_status || presence.online_status == OnlineStatus::Dnd {
            return Self::masked(presence.user_id);
        }

        Self {
            user_id: presence.user_id,
            online_status: presence.online_status,
            custom_message: presence.custom_status_message.clone(),
            last_seen: presence.last_activity,
            last_seen_text: last_seen_text(presence.online_status, presence.last_activity, now),
            show_status: true,
        }
    }

    /// 隐私遮蔽投影：对外表现为离线，不携带任何时间信息。
    fn masked(user_id: UserId) -> Self {
        Self {
            user_id,
            online_status: OnlineStatus::Offline,
            custom_message: None,
            last_seen: None,
            last_seen_text: "Last seen recently".to_string(),
            show_status: false,
        }
    }
}

/// 人性化的 "last seen" 文本。
pub fn last_seen_text(
    status: OnlineStatus,
    last_activity: Option<Timestamp>,
    now: Timestamp,
) -> String {
    match status {
        OnlineStatus::Online => return "Online now".to_string(),
        OnlineStatus::Away => return "Away".to_string(),
        _ => {}
    }

    let Some(last) = last_activity else {
        return "Last seen recently".to_string();
    };

    let elapsed = now - last;
    if elapsed < Duration::minutes(1) {
        "Just now".to_string()
    } else if elapsed < Duration::hours(1) {
        let minutes = elapsed.num_minutes();
        if minutes == 1 {
            "1 minute ago".to_string()
        } else {
            format!("{} minutes ago", minutes)
        }
    } else if elapsed < Duration::days(1) {
        let hours = elapsed.num_hours();
        if hours == 1 {
            "1 hour ago".to_string()
        } else {
            format!("{} hours ago", hours)
        }
    } else if elapsed < Duration::days(7) {
        let days = elapsed.num_days();
        if days == 1 {
            "1 day ago".to_string()
        } else {
            format!("{} days ago", days)
        }
    } else {
        "Last seen recently".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn presence(status: OnlineStatus, show: bool) -> UserPresence {
        UserPresence {
            user_id: UserId::from(Uuid::new_v4()),
            online_status: status,
            show_online_status: show,
            custom_status_message: Some(StatusMessage::parse("Busy").unwrap()),
            last_activity: Some(Utc::now() - Duration::minutes(5)),
        }
    }

    #[test]
    fn resolve_manual_override_wins_over_sessions() {
        assert_eq!(resolve_status(OnlineStatus::Away, 3), OnlineStatus::Away);
        assert_eq!(resolve_status(OnlineStatus::Away, 0), OnlineStatus::Away);
        assert_eq!(resolve_status(OnlineStatus::Dnd, 3), OnlineStatus::Dnd);
        assert_eq!(resolve_status(OnlineStatus::Dnd, 0), OnlineStatus::Dnd);
    }

    #[test]
    fn resolve_derives_from_session_count() {
        assert_eq!(resolve_status(OnlineStatus::Offline, 1), OnlineStatus::Online);
        assert_eq!(resolve_status(OnlineStatus::Online, 2), OnlineStatus::Online);
        assert_eq!(resolve_status(OnlineStatus::Online, 0), OnlineStatus::Offline);
        assert_eq!(resolve_status(OnlineStatus::Offline, 0), OnlineStatus::Offline);
    }

    #[test]
    fn resolve_is_idempotent() {
        for stored in [
            OnlineStatus::Online,
            OnlineStatus::Offline,
            OnlineStatus::Away,
            OnlineStatus::Dnd,
        ] {
            for count in [0, 1, 5] {
                let first = resolve_status(stored, count);
                let second = resolve_status(first, count);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn self_view_is_unfiltered() {
        let now = Utc::now();
        for status in [
            OnlineStatus::Online,
            OnlineStatus::Offline,
            OnlineStatus::Away,
            OnlineStatus::Dnd,
        ] {
            for show in [true, false] {
                let p = presence(status, show);
                let view = PresenceView::project(&p, Some(p.user_id), now);
                assert_eq!(view.online_status, status);
                assert_eq!(view.custom_message, p.custom_status_message);
                assert_eq!(view.last_seen, p.last_activity);
                assert_eq!(view.show_status, show);
            }
        }
    }

    #[test]
    fn privacy_disabled_user_appears_offline_to_others() {
        let now = Utc::now();
        let p = presence(OnlineStatus::Online, false);
        let viewer = Some(UserId::from(Uuid::new_v4()));

        let view = PresenceView::project(&p, viewer, now);
        assert_eq!(view.online_status, OnlineStatus::Offline);
        assert_eq!(view.last_seen, None);
        assert_eq!(view.last_seen_text, "Last seen recently");
        assert!(!view.show_status);
        assert_eq!(view.custom_message, None);
    }

    #[test]
    fn anonymous_viewer_gets_the_filtered_view() {
        let now = Utc::now();
        let p = presence(OnlineStatus::Online, false);

        let view = PresenceView::project(&p, None, now);
        assert_eq!(view.online_status, OnlineStatus::Offline);
        assert_eq!(view.last_seen, None);
    }

    #[test]
    fn dnd_is_indistinguishable_from_hidden_offline() {
        let now = Utc::now();
        let viewer = Some(UserId::from(Uuid::new_v4()));

        let dnd = presence(OnlineStatus::Dnd, true);
        let hidden = presence(OnlineStatus::Online, false);

        let dnd_view = PresenceView::project(&dnd, viewer, now);
        let hidden_view = PresenceView::project(&hidden, viewer, now);

        assert_eq!(dnd_view.online_status, hidden_view.online_status);
        assert_eq!(dnd_view.last_seen, hidden_view.last_seen);
        assert_eq!(dnd_view.last_seen_text, hidden_view.last_seen_text);
        assert_eq!(dnd_view.show_status, hidden_view.show_status);
        assert_eq!(dnd_view.custom_message, hidden_view.custom_message);
    }

    #[test]
    fn dnd_user_sees_own_dnd() {
        let now = Utc::now();
        let p = presence(OnlineStatus::Dnd, true);
        let view = PresenceView::project(&p, Some(p.user_id), now);
        assert_eq!(view.online_status, OnlineStatus::Dnd);
        assert_eq!(
            view.custom_message,
            Some(StatusMessage::parse("Busy").unwrap())
        );
    }

    #[test]
    fn visible_user_exposes_true_status() {
        let now = Utc::now();
        let viewer = Some(UserId::from(Uuid::new_v4()));
        let p = presence(OnlineStatus::Online, true);

        let view = PresenceView::project(&p, viewer, now);
        assert_eq!(view.online_status, OnlineStatus::Online);
        assert_eq!(view.last_seen, p.last_activity);
        assert_eq!(view.last_seen_text, "Online now");
        assert_eq!(view.custom_message, p.custom_status_message);
    }

    #[test]
    fn last_seen_text_buckets() {
        let now = Utc::now();
        let offline = OnlineStatus::Offline;

        assert_eq!(last_seen_text(OnlineStatus::Online, None, now), "Online now");
        assert_eq!(last_seen_text(offline, None, now), "Last seen recently");
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::seconds(30)), now),
            "Just now"
        );
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::minutes(5)), now),
            "5 minutes ago"
        );
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::minutes(1)), now),
            "1 minute ago"
        );
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::hours(3)), now),
            "3 hours ago"
        );
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::days(2)), now),
            "2 days ago"
        );
        assert_eq!(
            last_seen_text(offline, Some(now - Duration::days(30)), now),
            "Last seen recently"
        );
    }

    #[test]
    fn status_parse_round_trip() {
        for raw in ["online", "offline", "away", "dnd"] {
            let parsed: OnlineStatus = raw.parse().unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!("busy".parse::<OnlineStatus>().is_err());
    }
}
