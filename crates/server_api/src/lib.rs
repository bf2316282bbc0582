use chrono::Duration;
use shared::{
    domain::{ChatId, UserId},
    error::ApiError,
};
use storage::{Storage, StoredChat};
use tokio::sync::mpsc;

pub mod chats;
pub mod contacts;
pub mod feed;
pub mod media;
pub mod messages;
pub mod notifications;
pub mod statuses;
pub mod typing;
pub mod users;

pub use chats::{create_chat, get_chat, list_chats, subscribe_chats};
pub use contacts::{
    accept_contact_request, contact_state, list_contacts, reject_contact_request,
    send_contact_request, subscribe_contacts,
};
pub use feed::{ChangeFeed, Subscription};
pub use media::{download_media, upload_media};
pub use messages::{
    add_reaction, list_messages, mark_read, remove_reaction, send_message, subscribe_messages,
};
pub use notifications::{
    HttpPushGateway, LogPushGateway, MessageCreated, NotificationTrigger, NotificationWorker,
    PushGateway,
};
pub use statuses::{
    create_status, mark_status_viewed, status_feed, subscribe_statuses, sweep_expired_statuses,
};
pub use typing::{set_typing, subscribe_typing, sweep_stale_typing, typing_users};
pub use users::{
    get_profile, register_device_token, register_user, remove_device_token, update_profile,
    update_settings,
};

pub const DEFAULT_TYPING_STALE_SECS: i64 = 30;
pub const DEFAULT_STATUS_TTL_HOURS: i64 = 24;
pub const DEFAULT_FEED_CAPACITY: usize = 256;
pub const DEFAULT_MAX_MEDIA_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Typing records older than this are treated as not typing and swept.
    pub typing_stale_after: Duration,
    pub status_ttl: Duration,
    pub feed_capacity: usize,
    pub max_media_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            typing_stale_after: Duration::seconds(DEFAULT_TYPING_STALE_SECS),
            status_ttl: Duration::hours(DEFAULT_STATUS_TTL_HOURS),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            max_media_bytes: DEFAULT_MAX_MEDIA_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub feed: ChangeFeed,
    pub notifications: NotificationTrigger,
    pub config: ApiConfig,
}

impl ApiContext {
    /// Builds a context plus the receiving end of the new-message trigger
    /// queue, which belongs to a [`NotificationWorker`].
    pub fn new(
        storage: Storage,
        config: ApiConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MessageCreated>) {
        let (notifications, triggers) = NotificationTrigger::channel();
        let ctx = Self {
            storage,
            feed: ChangeFeed::new(config.feed_capacity),
            notifications,
            config,
        };
        (ctx, triggers)
    }
}

pub(crate) async fn ensure_user(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    let exists = ctx.storage.user_exists(user_id).await.map_err(internal)?;
    if !exists {
        return Err(ApiError::unauthenticated("unknown user"));
    }
    Ok(())
}

pub(crate) async fn ensure_participant(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<StoredChat, ApiError> {
    ensure_user(ctx, user_id).await?;
    let chat = ctx
        .storage
        .load_chat(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("chat not found"))?;
    if !chat.participants.contains(&user_id) {
        return Err(ApiError::permission_denied("user is not a chat participant"));
    }
    Ok(chat)
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
