//! Postgres 仓储实现
//!
//! 会话 upsert 依赖 `user_sessions.socket_id` 上的唯一约束，
//! 以 `INSERT ... ON CONFLICT DO UPDATE` 一条语句完成查找或创建，
//! 避免并发重连下 read-then-write 产生重复行。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use application::{ConversationRepository, Pagination, PresenceRepository, SessionRepository};
use domain::{
    DeviceType, OnlineStatus, RepositoryError, Session, SessionId, SocketId, StatusMessage,
    Timestamp, UserId, UserPresence,
};

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        other => RepositoryError::storage(other.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct SessionRecord {
    id: Uuid,
    user_id: Uuid,
    socket_id: String,
    device_type: Option<String>,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
    is_active: bool,
}

impl TryFrom<SessionRecord> for Session {
    type Error = RepositoryError;

    fn try_from(value: SessionRecord) -> Result<Self, Self::Error> {
        let socket_id =
            SocketId::parse(value.socket_id).map_err(|err| invalid_data(err.to_string()))?;
        let device_type = value
            .device_type
            .map(|raw| raw.parse::<DeviceType>())
            .transpose()
            .map_err(|err| invalid_data(err.to_string()))?;

        Ok(Session {
            id: SessionId::from(value.id),
            user_id: UserId::from(value.user_id),
            socket_id,
            device_type,
            connected_at: value.connected_at,
            last_ping: value.last_ping,
            is_active: value.is_active,
        })
    }
}

#[derive(Debug, FromRow)]
struct PresenceRecord {
    id: Uuid,
    online_status: String,
    show_online_status: bool,
    custom_status_message: Option<String>,
    last_activity: Option<DateTime<Utc>>,
}

impl TryFrom<PresenceRecord> for UserPresence {
    type Error = RepositoryError;

    fn try_from(value: PresenceRecord) -> Result<Self, Self::Error> {
        let online_status = value
            .online_status
            .parse::<OnlineStatus>()
            .map_err(|err| invalid_data(err.to_string()))?;
        let custom_status_message = value
            .custom_status_message
            .map(StatusMessage::parse)
            .transpose()
            .map_err(|err| invalid_data(err.to_string()))?;

        Ok(UserPresence {
            user_id: UserId::from(value.id),
            online_status,
            show_online_status: value.show_online_status,
            custom_status_message,
            last_activity: value.last_activity,
        })
    }
}

pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn upsert_connected(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
        device_type: Option<DeviceType>,
        now: Timestamp,
    ) -> Result<Session, RepositoryError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            INSERT INTO user_sessions (id, user_id, socket_id, device_type, connected_at, last_ping, is_active)
            VALUES ($1, $2, $3, $4, $5, $5, TRUE)
            ON CONFLICT (socket_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                device_type = EXCLUDED.device_type,
                connected_at = EXCLUDED.connected_at,
                last_ping = EXCLUDED.last_ping,
                is_active = TRUE
            RETURNING id, user_id, socket_id, device_type, connected_at, last_ping, is_active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(Uuid::from(user_id))
        .bind(socket_id.as_str())
        .bind(device_type.map(|d| d.as_str()))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.try_into()
    }

    async fn deactivate(
        &self,
        user_id: UserId,
        socket_id: &SocketId,
    ) -> Result<Option<Session>, RepositoryError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            UPDATE user_sessions
            SET is_active = FALSE
            WHERE socket_id = $1 AND user_id = $2 AND is_active
            RETURNING id, user_id, socket_id, device_type, connected_at, last_ping, is_active
            "#,
        )
        .bind(socket_id.as_str())
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Session::try_from).transpose()
    }

    async fn touch_active(
        &self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET last_ping = $2
            WHERE user_id = $1 AND is_active
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }

    async fn count_active(&self, user_id: UserId) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM user_sessions
            WHERE user_id = $1 AND is_active
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(count)
    }

    async fn latest_ping(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(last_ping) FROM user_sessions
            WHERE user_id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(latest)
    }

    async fn expire_stale(&self, cutoff: Timestamp) -> Result<Vec<UserId>, RepositoryError> {
        // 谓词在写入时重查 is_active，先于扫描重连的会话不会被降级
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE user_sessions
            SET is_active = FALSE
            WHERE is_active AND last_ping < $1
            RETURNING user_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut affected: Vec<UserId> = rows
            .into_iter()
            .map(|(user_id,)| UserId::from(user_id))
            .collect();
        affected.sort_by_key(|u| u.0);
        affected.dedup();
        Ok(affected)
    }

    async fn purge_inactive_before(&self, cutoff: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_sessions
            WHERE NOT is_active AND last_ping < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}

pub struct PgPresenceRepository {
    pool: PgPool,
}

impl PgPresenceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceRepository for PgPresenceRepository {
    async fn find(&self, user_id: UserId) -> Result<Option<UserPresence>, RepositoryError> {
        let record = sqlx::query_as::<_, PresenceRecord>(
            r#"
            SELECT id, online_status, show_online_status, custom_status_message, last_activity
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(UserPresence::try_from).transpose()
    }

    async fn update_status(
        &self,
        user_id: UserId,
        status: OnlineStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET online_status = $2 WHERE id = $1")
            .bind(Uuid::from(user_id))
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_status_message(
        &self,
        user_id: UserId,
        message: Option<StatusMessage>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET custom_status_message = $2 WHERE id = $1")
            .bind(Uuid::from(user_id))
            .bind(message.map(|m| m.into_inner()))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_visibility(
        &self,
        user_id: UserId,
        show_online_status: bool,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET show_online_status = $2 WHERE id = $1")
            .bind(Uuid::from(user_id))
            .bind(show_online_status)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_last_activity(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET last_activity = $2 WHERE id = $1")
            .bind(Uuid::from(user_id))
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_online(&self, page: Pagination) -> Result<Vec<UserPresence>, RepositoryError> {
        let records = sqlx::query_as::<_, PresenceRecord>(
            r#"
            SELECT id, online_status, show_online_status, custom_status_message, last_activity
            FROM users
            WHERE show_online_status AND online_status IN ('online', 'away')
            ORDER BY last_activity DESC NULLS LAST
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(UserPresence::try_from).collect()
    }
}

pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn partners_of(&self, user_id: UserId) -> Result<Vec<UserId>, RepositoryError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT CASE WHEN user_a = $1 THEN user_b ELSE user_a END AS partner
            FROM conversations
            WHERE is_active AND (user_a = $1 OR user_b = $1)
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|(partner,)| UserId::from(partner))
            .collect())
    }
}
