use async_trait::async_trait;
use futures::StreamExt;
use server_api::{ApiContext, Subscription};
use shared::{
    domain::{ChatId, MessageBody, MessageId, UserId},
    protocol::{ChatSummary, CreateChatResponse, MessagePayload, TypingUser},
};

use crate::{
    backend::{ChatBackend, SnapshotStream},
    error::BackendError,
};

/// Runs the session directly against an in-process [`ApiContext`].
#[derive(Clone)]
pub struct EmbeddedBackend {
    api: ApiContext,
}

impl EmbeddedBackend {
    pub fn new(api: ApiContext) -> Self {
        Self { api }
    }
}

fn boxed<T: Send + 'static>(sub: Subscription<T>) -> SnapshotStream<T> {
    Box::pin(sub.map(|snapshot| snapshot.map_err(BackendError::from)))
}

#[async_trait]
impl ChatBackend for EmbeddedBackend {
    async fn subscribe_chats(
        &self,
        user_id: UserId,
    ) -> Result<SnapshotStream<Vec<ChatSummary>>, BackendError> {
        let sub = server_api::subscribe_chats(&self.api, user_id).await?;
        Ok(boxed(sub))
    }

    async fn subscribe_messages(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<MessagePayload>>, BackendError> {
        let sub = server_api::subscribe_messages(&self.api, user_id, chat_id).await?;
        Ok(boxed(sub))
    }

    async fn subscribe_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<TypingUser>>, BackendError> {
        let sub = server_api::subscribe_typing(&self.api, chat_id, user_id).await?;
        Ok(boxed(sub))
    }

    async fn send_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        body: MessageBody,
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, BackendError> {
        Ok(server_api::send_message(&self.api, user_id, chat_id, body, reply_to).await?)
    }

    async fn add_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        Ok(server_api::add_reaction(&self.api, user_id, chat_id, message_id, emoji).await?)
    }

    async fn remove_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        Ok(server_api::remove_reaction(&self.api, user_id, chat_id, message_id, emoji).await?)
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        up_to: Option<MessageId>,
    ) -> Result<u64, BackendError> {
        Ok(server_api::mark_read(&self.api, user_id, chat_id, up_to).await?)
    }

    async fn set_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        is_typing: bool,
    ) -> Result<(), BackendError> {
        Ok(server_api::set_typing(&self.api, chat_id, user_id, is_typing).await?)
    }

    async fn create_chat(
        &self,
        user_id: UserId,
        participants: &[UserId],
        chat_name: Option<&str>,
        is_group_chat: bool,
    ) -> Result<CreateChatResponse, BackendError> {
        Ok(server_api::create_chat(&self.api, user_id, participants, chat_name, is_group_chat).await?)
    }

    async fn send_contact_request(
        &self,
        user_id: UserId,
        target: UserId,
    ) -> Result<(), BackendError> {
        Ok(server_api::send_contact_request(&self.api, user_id, target).await?)
    }

    async fn accept_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError> {
        Ok(server_api::accept_contact_request(&self.api, user_id, requester).await?)
    }

    async fn reject_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError> {
        Ok(server_api::reject_contact_request(&self.api, user_id, requester).await?)
    }
}
