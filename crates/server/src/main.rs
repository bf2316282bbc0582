use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use server_api::{
    ApiContext, HttpPushGateway, LogPushGateway, NotificationWorker, PushGateway,
};
use shared::{
    domain::{ChatId, MediaId, MessageId, StatusId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatSummary, ContactRequestBody, ContactsSummary, CreateChatRequest, CreateChatResponse,
        CreateStatusRequest, CreateStatusResponse, DeviceTokenRequest, MarkReadRequest,
        MarkReadResponse, MediaRef, MessagePayload, ReactionRequest, RegisterUserRequest,
        SendMessageRequest, SetTypingRequest, StatusPayload, SweepReport, TypingUser,
        UpdateProfileRequest, UserProfile,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MediaUploadQuery {
    user_id: i64,
    chat_id: i64,
    filename: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusViewRequest {
    user_id: UserId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (api, triggers) = ApiContext::new(storage, settings.api_config());
    let worker = NotificationWorker::new(api.storage.clone(), push_gateway(&settings))
        .with_token_pruning(settings.prune_invalid_tokens);
    tokio::spawn(worker.run(triggers));
    spawn_sweeper(
        api.clone(),
        Duration::from_secs(settings.sweep_interval_secs.max(1)),
    );

    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn push_gateway(settings: &Settings) -> Arc<dyn PushGateway> {
    match &settings.push_endpoint {
        Some(endpoint) => {
            info!(%endpoint, "push notifications via HTTP gateway");
            Arc::new(HttpPushGateway::new(
                endpoint.clone(),
                settings.push_api_key.clone(),
            ))
        }
        None => {
            info!("no push endpoint configured; push notifications are logged only");
            Arc::new(LogPushGateway)
        }
    }
}

/// Periodically removes stale typing indicators and expired statuses.
fn spawn_sweeper(api: ApiContext, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = server_api::sweep_stale_typing(&api, now).await {
                warn!(?err, "typing sweep failed");
            }
            if let Err(err) = server_api::sweep_expired_statuses(&api, now).await {
                warn!(?err, "status sweep failed");
            }
        }
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    let max_media_bytes = state.api.config.max_media_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_register_user))
        .route("/users/:user_id", get(http_get_profile))
        .route("/users/:user_id/profile", put(http_update_profile))
        .route("/users/:user_id/settings", put(http_update_settings))
        .route(
            "/users/:user_id/device_tokens",
            post(http_add_device_token).delete(http_remove_device_token),
        )
        .route("/contacts", get(http_list_contacts))
        .route("/contacts/requests", post(http_send_contact_request))
        .route("/contacts/requests/accept", post(http_accept_contact_request))
        .route("/contacts/requests/reject", post(http_reject_contact_request))
        .route("/chats", get(http_list_chats).post(http_create_chat))
        .route(
            "/chats/:chat_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route(
            "/chats/:chat_id/messages/:message_id/reactions",
            post(http_add_reaction).delete(http_remove_reaction),
        )
        .route("/chats/:chat_id/read", post(http_mark_read))
        .route(
            "/chats/:chat_id/typing",
            get(http_typing_users).post(http_set_typing),
        )
        .route("/statuses", post(http_create_status))
        .route("/statuses/feed", get(http_status_feed))
        .route("/statuses/:status_id/views", post(http_mark_status_viewed))
        .route("/maintenance/statuses/sweep", post(http_sweep_statuses))
        .route("/maintenance/typing/sweep", post(http_sweep_typing))
        .route(
            "/media",
            post(http_upload_media)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_media_bytes)),
        )
        .route("/media/:media_id", get(http_download_media))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::NetworkFailure => StatusCode::BAD_GATEWAY,
    }
}

fn http_error(err: ApiError) -> HttpError {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = server_api::register_user(&state.api, &req.identity, &req.display_name)
        .await
        .map_err(http_error)?;
    Ok(Json(profile))
}

async fn http_get_profile(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = server_api::get_profile(&state.api, UserId(user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(profile))
}

async fn http_update_profile(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = server_api::update_profile(
        &state.api,
        UserId(user_id),
        req.display_name.as_deref(),
        req.avatar_url.as_deref(),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(profile))
}

async fn http_update_settings(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(settings): Json<serde_json::Value>,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = server_api::update_settings(&state.api, UserId(user_id), settings)
        .await
        .map_err(http_error)?;
    Ok(Json(profile))
}

async fn http_add_device_token(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<DeviceTokenRequest>,
) -> Result<StatusCode, HttpError> {
    server_api::register_device_token(&state.api, UserId(user_id), &req.token)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_device_token(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<DeviceTokenRequest>,
) -> Result<StatusCode, HttpError> {
    server_api::remove_device_token(&state.api, UserId(user_id), &req.token)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_contacts(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ContactsSummary>, HttpError> {
    let contacts = server_api::list_contacts(&state.api, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(contacts))
}

async fn http_send_contact_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequestBody>,
) -> Result<StatusCode, HttpError> {
    server_api::send_contact_request(&state.api, req.user_id, req.other_user_id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_accept_contact_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequestBody>,
) -> Result<StatusCode, HttpError> {
    server_api::accept_contact_request(&state.api, req.user_id, req.other_user_id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_reject_contact_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequestBody>,
) -> Result<StatusCode, HttpError> {
    server_api::reject_contact_request(&state.api, req.user_id, req.other_user_id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<ChatSummary>>, HttpError> {
    let chats = server_api::list_chats(&state.api, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(chats))
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<CreateChatResponse>, HttpError> {
    let created = server_api::create_chat(
        &state.api,
        req.user_id,
        &req.participants,
        req.chat_name.as_deref(),
        req.is_group_chat,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(created))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let messages = server_api::list_messages(&state.api, UserId(q.user_id), ChatId(chat_id), q.limit)
        .await
        .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let message = server_api::send_message(
        &state.api,
        req.user_id,
        ChatId(chat_id),
        req.body,
        req.reply_to,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(message))
}

async fn http_add_reaction(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let message = server_api::add_reaction(
        &state.api,
        req.user_id,
        ChatId(chat_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(message))
}

async fn http_remove_reaction(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let message = server_api::remove_reaction(
        &state.api,
        req.user_id,
        ChatId(chat_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(message))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, HttpError> {
    let marked = server_api::mark_read(&state.api, req.user_id, ChatId(chat_id), req.up_to)
        .await
        .map_err(http_error)?;
    Ok(Json(MarkReadResponse { marked }))
}

async fn http_typing_users(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<TypingUser>>, HttpError> {
    let users = server_api::typing_users(&state.api, ChatId(chat_id), UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(users))
}

async fn http_set_typing(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(req): Json<SetTypingRequest>,
) -> Result<StatusCode, HttpError> {
    server_api::set_typing(&state.api, ChatId(chat_id), req.user_id, req.is_typing)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_create_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStatusRequest>,
) -> Result<Json<CreateStatusResponse>, HttpError> {
    let status_id = server_api::create_status(
        &state.api,
        req.user_id,
        &req.content,
        req.media_url.as_deref(),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(CreateStatusResponse { status_id }))
}

async fn http_status_feed(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<StatusPayload>>, HttpError> {
    let feed = server_api::status_feed(&state.api, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(feed))
}

async fn http_mark_status_viewed(
    State(state): State<Arc<AppState>>,
    Path(status_id): Path<i64>,
    Json(req): Json<StatusViewRequest>,
) -> Result<StatusCode, HttpError> {
    server_api::mark_status_viewed(&state.api, StatusId(status_id), req.user_id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_sweep_statuses(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepReport>, HttpError> {
    let report = server_api::sweep_expired_statuses(&state.api, Utc::now())
        .await
        .map_err(http_error)?;
    Ok(Json(report))
}

async fn http_sweep_typing(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepReport>, HttpError> {
    let report = server_api::sweep_stale_typing(&state.api, Utc::now())
        .await
        .map_err(http_error)?;
    Ok(Json(report))
}

async fn http_upload_media(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MediaUploadQuery>,
    body: Bytes,
) -> Result<Json<MediaRef>, HttpError> {
    let media = server_api::upload_media(
        &state.api,
        UserId(q.user_id),
        ChatId(q.chat_id),
        &body,
        q.filename.as_deref(),
        q.mime_type.as_deref(),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(media))
}

async fn http_download_media(
    State(state): State<Arc<AppState>>,
    Path(media_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let media = server_api::download_media(&state.api, MediaId(media_id), UserId(q.user_id))
        .await
        .map_err(http_error)?;

    let mut headers = HeaderMap::new();
    let content_type = media
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(filename) = media.filename {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok((StatusCode::OK, headers, media.bytes))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let user_id = UserId(q.user_id);
    let known = state
        .api
        .storage
        .user_exists(user_id)
        .await
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;
    if !known {
        return Err(http_error(ApiError::unauthenticated("unknown user")));
    }
    Ok(ws.on_upgrade(move |socket| ws::ws_connection(state, socket, user_id)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
