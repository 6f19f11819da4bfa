//! 活动信号限流器
//!
//! 被动活动信号（例如普通请求携带的"用户还活着"信号）到达频率远高于
//! 需要落库的频率。这里用进程内的 per-user 时间戳表把写入折叠到一个
//! 节流窗口内；显式活动信号绕过节流。表的大小以并发活跃用户数为界，
//! 进程重启即清空（最坏情况每用户多写一次）。

use domain::UserId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// 被动活动写入节流器。
pub struct ActivityThrottle {
    /// 两次落库之间的最小间隔
    window: Duration,
    /// 每个用户最近一次落库时刻
    last_write: RwLock<HashMap<UserId, Instant>>,
}

impl ActivityThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_write: RwLock::new(HashMap::new()),
        }
    }

    /// 被动信号是否允许落库。允许时同时预占本次写入的时间槽，
    /// 因此并发调用中同一窗口内只有一个调用者拿到 true。
    pub fn should_write(&self, user_id: UserId) -> bool {
        let now = Instant::now();

        let Ok(mut last_write) = self.last_write.write() else {
            // 锁中毒时放行写入，宁可多写一次也不丢活动信号
            return true;
        };

        match last_write.get(&user_id) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                last_write.insert(user_id, now);
                true
            }
        }
    }

    /// 显式活动信号：无条件写入，并刷新节流时间槽。
    pub fn record_explicit(&self, user_id: UserId) {
        if let Ok(mut last_write) = self.last_write.write() {
            last_write.insert(user_id, Instant::now());
        }
    }

    /// 清理早已超出窗口的条目，防止长时间运行下的缓慢增长。
    pub fn cleanup_stale(&self) {
        if let Ok(mut last_write) = self.last_write.write() {
            let now = Instant::now();
            let window = self.window;
            last_write.retain(|_, last| now.duration_since(*last) < window * 2);
        }
    }

    /// 当前跟踪的用户数量（用于观测）。
    pub fn tracked_users(&self) -> usize {
        self.last_write.read().map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for ActivityThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_passive_signals_are_throttled() {
        let throttle = ActivityThrottle::new(Duration::from_secs(30));
        let user_id = UserId::from(Uuid::new_v4());

        // 第一个信号放行，窗口内的后续信号被丢弃
        assert!(throttle.should_write(user_id));
        for _ in 0..10 {
            assert!(!throttle.should_write(user_id));
        }
    }

    #[test]
    fn test_window_expiry_allows_next_write() {
        let throttle = ActivityThrottle::new(Duration::from_millis(50));
        let user_id = UserId::from(Uuid::new_v4());

        assert!(throttle.should_write(user_id));
        assert!(!throttle.should_write(user_id));

        std::thread::sleep(Duration::from_millis(80));
        assert!(throttle.should_write(user_id));
    }

    #[test]
    fn test_users_are_throttled_independently() {
        let throttle = ActivityThrottle::new(Duration::from_secs(30));
        let first = UserId::from(Uuid::new_v4());
        let second = UserId::from(Uuid::new_v4());

        assert!(throttle.should_write(first));
        assert!(throttle.should_write(second));
        assert!(!throttle.should_write(first));
        assert!(!throttle.should_write(second));
    }

    #[test]
    fn test_explicit_signal_refreshes_slot() {
        let throttle = ActivityThrottle::new(Duration::from_millis(50));
        let user_id = UserId::from(Uuid::new_v4());

        std::thread::sleep(Duration::from_millis(60));
        throttle.record_explicit(user_id);

        // 显式写入之后被动信号重新进入节流窗口
        assert!(!throttle.should_write(user_id));
    }

    #[test]
    fn test_cleanup_retains_recent_entries() {
        let throttle = ActivityThrottle::new(Duration::from_millis(20));
        let stale = UserId::from(Uuid::new_v4());
        let fresh = UserId::from(Uuid::new_v4());

        assert!(throttle.should_write(stale));
        std::thread::sleep(Duration::from_millis(60));
        assert!(throttle.should_write(fresh));

        throttle.cleanup_stale();
        assert_eq!(throttle.tracked_users(), 1);
    }
}
