use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::{Pagination, SetStatusRequest};
use domain::{OnlineStatus, PresenceView, StatusMessage, UserId};

use crate::{error::ApiError, state::AppState, websocket};

#[derive(Debug, Deserialize)]
struct SetStatusPayload {
    status: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsPayload {
    show_online_status: bool,
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    show_online_status: bool,
}

#[derive(Debug, Deserialize)]
struct OnlineQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/presence", presence_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn presence_routes() -> Router<AppState> {
    Router::new()
        .route("/users/{user_id}", get(get_user_presence))
        .route("/status", patch(set_status))
        .route("/settings", get(get_settings).patch(update_settings))
        .route("/online", get(list_online))
        .route("/activity", post(record_activity))
        .route("/ws", get(websocket::websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 公开查询，凭证可选：携带有效凭证且查询自己时返回未过滤的真实状态。
async fn get_user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<PresenceView>, ApiError> {
    let viewer = state
        .jwt_service
        .try_extract_user(&headers)
        .map(UserId::from);

    let view = state
        .presence_service
        .get_presence(UserId::from(user_id), viewer)
        .await?;

    Ok(Json(view))
}

async fn set_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetStatusPayload>,
) -> Result<Json<PresenceView>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    // 校验在边界完成，非法载荷不会进入核心
    let status = payload
        .status
        .parse::<OnlineStatus>()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let message = payload
        .message
        .map(StatusMessage::parse)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let view = state
        .presence_service
        .set_status(SetStatusRequest {
            user_id: UserId::from(user_id),
            status,
            message,
        })
        .await?;

    Ok(Json(view))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SettingsResponse>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    let show_online_status = state
        .presence_service
        .get_visibility(UserId::from(user_id))
        .await?;

    Ok(Json(SettingsResponse { show_online_status }))
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SettingsPayload>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    state
        .presence_service
        .update_visibility(UserId::from(user_id), payload.show_online_status)
        .await?;

    Ok(Json(SettingsResponse {
        show_online_status: payload.show_online_status,
    }))
}

async fn list_online(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OnlineQuery>,
) -> Result<Json<Vec<PresenceView>>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    let defaults = Pagination::default();
    let page = Pagination {
        limit: query.limit.unwrap_or(defaults.limit).clamp(1, 200),
        offset: query.offset.unwrap_or(defaults.offset).max(0),
    };

    let listing = state
        .presence_service
        .list_online(Some(UserId::from(user_id)), page)
        .await?;

    Ok(Json(listing))
}

/// 显式活动信号：绕过节流窗口，立即落库。
async fn record_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;

    state
        .presence_service
        .record_activity(UserId::from(user_id), true)
        .await?;

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_status_payload_deserializes() {
        let payload: SetStatusPayload =
            serde_json::from_str(r#"{"status": "dnd", "message": "Busy"}"#).unwrap();
        assert_eq!(payload.status, "dnd");
        assert_eq!(payload.message.as_deref(), Some("Busy"));

        let bare: SetStatusPayload = serde_json::from_str(r#"{"status": "online"}"#).unwrap();
        assert!(bare.message.is_none());
    }

    #[test]
    fn settings_payload_requires_boolean() {
        assert!(serde_json::from_str::<SettingsPayload>(r#"{"show_online_status": true}"#).is_ok());
        // 非布尔值在反序列化边界被拒绝
        assert!(
            serde_json::from_str::<SettingsPayload>(r#"{"show_online_status": "yes"}"#).is_err()
        );
    }

    #[test]
    fn invalid_status_value_is_rejected_at_the_boundary() {
        assert!("busy".parse::<OnlineStatus>().is_err());
        assert!(StatusMessage::parse("x".repeat(101)).is_err());
    }
}
