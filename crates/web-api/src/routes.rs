use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

use application::services::{
    CreateConversationRequest, RegisterDeviceTokenRequest, SendMessageRequest,
    UpdatePreferencesRequest,
};
use domain::{
    Conversation, ConversationId, DeliveryUpdate, DevicePlatform, DeviceToken, Message,
    MessageId, NotificationPreference, UserId,
};

use crate::{auth::AuthUser, error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize, Validate)]
struct CreateConversationPayload {
    /// 创建者自动加入，可以不列出
    #[validate(length(min = 1, max = 500))]
    participant_ids: Vec<Uuid>,
    #[serde(default)]
    is_group: bool,
    #[validate(length(max = 100))]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    after: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AddParticipantPayload {
    user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
struct RegisterTokenPayload {
    #[validate(length(min = 1, max = 512))]
    token: String,
    platform: DevicePlatform,
}

#[derive(Debug, Deserialize, Validate)]
struct UnregisterTokenPayload {
    #[validate(length(min = 1))]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateSettingsPayload {
    message: Option<bool>,
    alert: Option<bool>,
    event: Option<bool>,
    help_request: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(send_message).get(list_messages),
        )
        .route(
            "/conversations/{conversation_id}/participants",
            post(add_participant),
        )
        .route(
            "/conversations/{conversation_id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route(
            "/conversations/{conversation_id}/archive",
            post(archive_conversation),
        )
        .route("/messages/{message_id}/read", post(mark_read))
        .route("/notifications/register-token", post(register_token))
        .route("/notifications/unregister-token", delete(unregister_token))
        .route(
            "/notifications/settings",
            get(notification_settings).put(update_notification_settings),
        )
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    payload.validate()?;
    let conversation = state
        .chat_service
        .create_conversation(CreateConversationRequest {
            creator_id: user_id,
            participant_ids: payload.participant_ids.into_iter().map(UserId::from).collect(),
            is_group: payload.is_group,
            name: payload.name,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.chat_service.list_conversations(user_id).await?))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .chat_service
        .list_messages(
            user_id,
            ConversationId::from(conversation_id),
            query.after.unwrap_or(0),
            query.limit,
        )
        .await?;

    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let message = state
        .chat_service
        .send_message(SendMessageRequest {
            conversation_id: ConversationId::from(conversation_id),
            sender_id: user_id,
            content: payload.content,
            origin: None,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn add_participant(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<AddParticipantPayload>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .chat_service
        .add_participant(
            user_id,
            ConversationId::from(conversation_id),
            UserId::from(payload.user_id),
        )
        .await?;

    Ok(Json(conversation))
}

async fn remove_participant(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((conversation_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .chat_service
        .remove_participant(
            user_id,
            ConversationId::from(conversation_id),
            UserId::from(member_id),
        )
        .await?;

    Ok(Json(conversation))
}

async fn archive_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .chat_service
        .archive_conversation(user_id, ConversationId::from(conversation_id))
        .await?;

    Ok(Json(conversation))
}

/// 发送者对自己的消息调用时返回 `null`
async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Option<DeliveryUpdate>>, ApiError> {
    let update = state
        .chat_service
        .mark_read(user_id, MessageId::from(message_id))
        .await?;

    Ok(Json(update))
}

async fn register_token(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<RegisterTokenPayload>,
) -> Result<(StatusCode, Json<DeviceToken>), ApiError> {
    payload.validate()?;
    let token = state
        .chat_service
        .register_device_token(RegisterDeviceTokenRequest {
            user_id,
            token: payload.token,
            platform: payload.platform,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(token)))
}

async fn unregister_token(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UnregisterTokenPayload>,
) -> Result<StatusCode, ApiError> {
    payload.validate()?;
    state
        .chat_service
        .unregister_device_token(user_id, &payload.token)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn notification_settings(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<NotificationPreference>, ApiError> {
    Ok(Json(state.chat_service.notification_settings(user_id).await?))
}

async fn update_notification_settings(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateSettingsPayload>,
) -> Result<Json<NotificationPreference>, ApiError> {
    let preference = state
        .chat_service
        .update_notification_settings(
            user_id,
            UpdatePreferencesRequest {
                message: payload.message,
                alert: payload.alert,
                event: payload.event,
                help_request: payload.help_request,
            },
        )
        .await?;

    Ok(Json(preference))
}

/// 升级前先校验令牌，无效凭证直接以 401 拒绝
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.jwt_service.verify_token(&query.token)?;
    Ok(ws.on_upgrade(move |socket| async move {
        match state.gateway.on_connect(&query.token).await {
            Ok(handle) => WebSocketConnection::new(state, handle).run(socket).await,
            Err(err) => tracing::warn!(error = %err, "websocket connection refused"),
        }
    }))
}
