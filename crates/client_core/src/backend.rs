//! The seam between a [`crate::ChatSession`] and whatever serves it.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use shared::{
    domain::{ChatId, MessageBody, MessageId, UserId},
    protocol::{ChatSummary, CreateChatResponse, MessagePayload, TypingUser},
};

use crate::error::BackendError;

/// Live snapshots of one query. Dropping the stream releases the
/// subscription behind it.
pub type SnapshotStream<T> = Pin<Box<dyn Stream<Item = Result<T, BackendError>> + Send>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn subscribe_chats(
        &self,
        user_id: UserId,
    ) -> Result<SnapshotStream<Vec<ChatSummary>>, BackendError>;

    async fn subscribe_messages(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<MessagePayload>>, BackendError>;

    async fn subscribe_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<TypingUser>>, BackendError>;

    async fn send_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        body: MessageBody,
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, BackendError>;

    async fn add_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError>;

    async fn remove_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError>;

    async fn mark_read(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        up_to: Option<MessageId>,
    ) -> Result<u64, BackendError>;

    async fn set_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        is_typing: bool,
    ) -> Result<(), BackendError>;

    async fn create_chat(
        &self,
        user_id: UserId,
        participants: &[UserId],
        chat_name: Option<&str>,
        is_group_chat: bool,
    ) -> Result<CreateChatResponse, BackendError>;

    async fn send_contact_request(
        &self,
        user_id: UserId,
        target: UserId,
    ) -> Result<(), BackendError>;

    async fn accept_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError>;

    async fn reject_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError>;
}
