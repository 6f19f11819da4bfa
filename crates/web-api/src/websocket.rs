//! WebSocket 处理器
//!
//! 连接升级即会话登记：升级成功立刻 `connect`，连接关闭时
//! `disconnect`。入站帧承载 setStatus / typing / activity /
//! subscribeOnline 指令，出站帧是按接收者隐私过滤后的
//! presenceUpdate / userTyping 事件。

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use application::{ConnectionId, SetStatusRequest};
use domain::{DeviceType, OnlineStatus, SocketId, StatusMessage, UserId};

use crate::{error::ApiError, state::AppState};

/// WebSocket连接查询参数
#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    /// JWT access token
    pub token: String,
    /// 设备类型（可选元数据）
    pub device: Option<String>,
}

/// 客户端入站帧
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    SetStatus {
        status: String,
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { to: Uuid, is_typing: bool },
    Activity,
    SubscribeOnline,
    UnsubscribeOnline,
}

/// 处理WebSocket连接升级
pub async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WebSocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = state.jwt_service.verify_token(&query.token)?;
    let user_id = UserId::from(claims.user_id);

    let device_type = query
        .device
        .as_deref()
        .map(str::parse::<DeviceType>)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    tracing::info!(user_id = %user_id, device = ?device_type, "WebSocket upgrade");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, device_type, state)))
}

async fn handle_socket(
    socket: WebSocket,
    user_id: UserId,
    device_type: Option<DeviceType>,
    state: AppState,
) {
    let socket_id = SocketId::generate();

    // 登记失败就放弃这条连接，凭证已验证过，剩下的只有存储故障
    if let Err(err) = state
        .presence_service
        .connect(user_id, socket_id.clone(), device_type)
        .await
    {
        tracing::error!(user_id = %user_id, error = %err, "session connect failed");
        return;
    }

    let (connection_id, mut events) = state.broadcaster.register(user_id);
    let (mut sender, mut receiver) = socket.split();

    // 出站事件泵：事件通道 -> WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "event serialization failed");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // 入站帧循环
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                // 任何入站流量都算一次被动活动信号
                state.presence_service.note_activity(user_id).await;

                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => handle_frame(&state, user_id, connection_id, frame).await,
                    Err(err) => {
                        tracing::debug!(user_id = %user_id, error = %err, "malformed frame");
                    }
                }
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                state.presence_service.note_activity(user_id).await;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // 连接收尾：注销推送通道、退订本连接的在线视图、关闭会话。
    // 订阅按连接记账，同一用户其余连接的订阅保持不变。
    send_task.abort();
    state.broadcaster.unregister(user_id, connection_id);
    state.online_view.unsubscribe(user_id, connection_id);

    if let Err(err) = state
        .presence_service
        .disconnect(user_id, socket_id)
        .await
    {
        tracing::warn!(user_id = %user_id, error = %err, "session disconnect failed");
    }

    tracing::info!(user_id = %user_id, "WebSocket closed");
}

async fn handle_frame(
    state: &AppState,
    user_id: UserId,
    connection_id: ConnectionId,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::SetStatus { status, message } => {
            let Ok(status) = status.parse::<OnlineStatus>() else {
                tracing::debug!(user_id = %user_id, "invalid status in frame");
                return;
            };
            let message = match message.map(StatusMessage::parse).transpose() {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!(user_id = %user_id, error = %err, "invalid status message");
                    return;
                }
            };

            if let Err(err) = state
                .presence_service
                .set_status(SetStatusRequest {
                    user_id,
                    status,
                    message,
                })
                .await
            {
                tracing::warn!(user_id = %user_id, error = %err, "setStatus failed");
            }
        }
        ClientFrame::Typing { to, is_typing } => {
            if let Err(err) = state
                .presence_service
                .typing(user_id, UserId::from(to), is_typing)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %err, "typing relay failed");
            }
        }
        ClientFrame::Activity => {
            if let Err(err) = state
                .presence_service
                .record_activity(user_id, true)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %err, "explicit activity failed");
            }
        }
        ClientFrame::SubscribeOnline => {
            state.online_view.subscribe(user_id, connection_id);
        }
        ClientFrame::UnsubscribeOnline => {
            state.online_view.unsubscribe(user_id, connection_id);
        }
    }
}
