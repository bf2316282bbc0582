use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChatId, MediaId, MessageBody, MessageId, ReceiptMark, ReplyPreview, StatusId, UserId,
    },
    error::ApiError,
};

/// A live query a client can subscribe to. Every mutation on the server
/// publishes the topics whose snapshot it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Topic {
    ChatMessages { chat_id: ChatId },
    ChatTyping { chat_id: ChatId },
    UserChats { user_id: UserId },
    UserContacts { user_id: UserId },
    Statuses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub identity: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactsSummary {
    pub contacts: Vec<UserId>,
    pub pending_requests: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestMessage {
    pub preview: String,
    pub sender_id: UserId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub participants: Vec<UserId>,
    pub is_group_chat: bool,
    pub chat_name: String,
    pub admins: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<LatestMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub chat_id: ChatId,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl MessagePayload {
    /// Single vs double check: any reader besides the sender counts as read.
    pub fn receipt(&self) -> ReceiptMark {
        if self.read_by.len() > 1 {
            ReceiptMark::Read
        } else {
            ReceiptMark::Sent
        }
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, BTreeSet::len)
    }

    pub fn has_reacted(&self, user_id: UserId, emoji: &str) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.contains(&user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: UserId,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status_id: StatusId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub viewed_by: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_id: MediaId,
    pub url: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweepReport {
    pub deleted_count: u64,
}

/// Request bodies of the REST surface. Every mutating call names the caller
/// in `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub identity: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContactRequestBody {
    pub user_id: UserId,
    pub other_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub user_id: UserId,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub is_group_chat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetTypingRequest {
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStatusRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreateStatusResponse {
    pub status_id: StatusId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserQuery {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
    },
    ChatsSnapshot {
        user_id: UserId,
        chats: Vec<ChatSummary>,
    },
    MessagesSnapshot {
        chat_id: ChatId,
        messages: Vec<MessagePayload>,
    },
    TypingSnapshot {
        chat_id: ChatId,
        users: Vec<TypingUser>,
    },
    ContactsSnapshot {
        user_id: UserId,
        contacts: ContactsSummary,
    },
    StatusesSnapshot {
        statuses: Vec<StatusPayload>,
    },
    Error(ApiError),
}
