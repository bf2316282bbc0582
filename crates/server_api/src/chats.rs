use std::collections::BTreeSet;

use chrono::Utc;
use shared::{
    domain::{ChatId, UserId},
    error::ApiError,
    protocol::{ChatSummary, CreateChatResponse, LatestMessage, Topic},
};
use storage::{direct_chat_key, NewChat, StoredChat};
use tracing::info;

use crate::{ensure_participant, ensure_user, feed::Subscription, internal, ApiContext};

const MAX_CHAT_NAME_CHARS: usize = 100;

/// Creates a chat. A non-group chat between two people is find-or-create:
/// asking again for the same pair, in either order, returns the existing chat
/// with `exists = true`.
pub async fn create_chat(
    ctx: &ApiContext,
    creator: UserId,
    participants: &[UserId],
    chat_name: Option<&str>,
    is_group_chat: bool,
) -> Result<CreateChatResponse, ApiError> {
    ensure_user(ctx, creator).await?;
    if participants.is_empty() {
        return Err(ApiError::invalid_argument("participants are required"));
    }

    let mut members: BTreeSet<UserId> = participants.iter().copied().collect();
    members.insert(creator);
    for member in &members {
        let exists = ctx.storage.user_exists(*member).await.map_err(internal)?;
        if !exists {
            return Err(ApiError::not_found(format!("user {member} not found")));
        }
    }
    if members.len() < 2 {
        return Err(ApiError::invalid_argument(
            "a chat needs at least one other participant",
        ));
    }
    if !is_group_chat && members.len() != 2 {
        return Err(ApiError::invalid_argument(
            "direct chats have exactly two participants",
        ));
    }

    let chat_name = chat_name.map(str::trim).unwrap_or_default();
    if chat_name.chars().count() > MAX_CHAT_NAME_CHARS {
        return Err(ApiError::invalid_argument("chat name is too long"));
    }

    let members: Vec<UserId> = members.into_iter().collect();
    let direct_key = (!is_group_chat).then(|| direct_chat_key(members[0], members[1]));
    let admins = if is_group_chat { vec![creator] } else { Vec::new() };

    let (chat_id, created) = ctx
        .storage
        .create_chat(NewChat {
            participants: &members,
            is_group_chat,
            chat_name,
            admins: &admins,
            direct_key,
            created_at: Utc::now(),
        })
        .await
        .map_err(internal)?;

    if created {
        info!(chat_id = chat_id.0, creator = creator.0, is_group_chat, "chat created");
        for member in &members {
            ctx.feed.publish(Topic::UserChats { user_id: *member });
        }
    }

    Ok(CreateChatResponse {
        chat_id,
        exists: !created,
    })
}

pub async fn get_chat(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
) -> Result<ChatSummary, ApiError> {
    let chat = ensure_participant(ctx, chat_id, user_id).await?;
    Ok(chat_summary(chat))
}

/// The user's chats, most recently active first.
pub async fn list_chats(ctx: &ApiContext, user_id: UserId) -> Result<Vec<ChatSummary>, ApiError> {
    ensure_user(ctx, user_id).await?;
    let chats = ctx
        .storage
        .list_chats_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(chats.into_iter().map(chat_summary).collect())
}

pub async fn subscribe_chats(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Subscription<Vec<ChatSummary>>, ApiError> {
    ensure_user(ctx, user_id).await?;
    let loader = ctx.clone();
    Ok(ctx.feed.watch(Topic::UserChats { user_id }, move || {
        let ctx = loader.clone();
        async move { list_chats(&ctx, user_id).await }
    }))
}

pub(crate) fn chat_summary(chat: StoredChat) -> ChatSummary {
    ChatSummary {
        chat_id: chat.chat_id,
        participants: chat.participants,
        is_group_chat: chat.is_group_chat,
        chat_name: chat.chat_name,
        admins: chat.admins,
        latest_message: chat.latest_message.map(|latest| LatestMessage {
            preview: latest.preview,
            sender_id: latest.sender_id,
            sent_at: latest.sent_at,
        }),
        created_at: chat.created_at,
        updated_at: chat.updated_at,
    }
}

#[cfg(test)]
#[path = "tests/chats_tests.rs"]
mod tests;
