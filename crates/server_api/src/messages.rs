use chrono::Utc;
use shared::{
    domain::{ChatId, MessageBody, MessageId, ReplyPreview, UserId},
    error::ApiError,
    protocol::{MessagePayload, Topic},
};
use storage::StoredMessage;
use tracing::{error, info};

use crate::{
    ensure_participant, feed::Subscription, internal, notifications::MessageCreated, ApiContext,
};

const MAX_TEXT_CHARS: usize = 4096;
const MAX_EMOJI_BYTES: usize = 32;

/// Appends a message to the chat log, then refreshes the chat's preview as a
/// separate write. A failure of the second write leaves a stale preview but
/// the message stays delivered, so it is logged rather than returned.
pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    chat_id: ChatId,
    body: MessageBody,
    reply_to: Option<MessageId>,
) -> Result<MessagePayload, ApiError> {
    let chat = ensure_participant(ctx, chat_id, sender_id).await?;
    if !body.is_deliverable() {
        return Err(ApiError::invalid_argument("message has no content"));
    }
    if let MessageBody::Text { content } = &body {
        if content.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::invalid_argument("message is too long"));
        }
    }

    let reply_preview = match reply_to {
        Some(original_id) => Some(reply_snapshot(ctx, chat_id, original_id).await?),
        None => None,
    };

    let stored = ctx
        .storage
        .insert_message(chat_id, sender_id, &body, reply_preview.as_ref(), Utc::now())
        .await
        .map_err(internal)?;
    ctx.feed.publish(Topic::ChatMessages { chat_id });
    ctx.notifications.fire(MessageCreated {
        chat_id,
        message_id: stored.message_id,
        sender_id,
    });
    info!(
        chat_id = chat_id.0,
        message_id = stored.message_id.0,
        sender_id = sender_id.0,
        kind = body.kind().as_str(),
        "message stored"
    );

    match ctx
        .storage
        .update_latest_message(chat_id, &body.preview(), sender_id, stored.sent_at)
        .await
    {
        Ok(()) => {
            for participant in &chat.participants {
                ctx.feed.publish(Topic::UserChats {
                    user_id: *participant,
                });
            }
        }
        Err(err) => {
            error!(
                chat_id = chat_id.0,
                message_id = stored.message_id.0,
                %err,
                "failed to update chat preview; message is stored"
            );
        }
    }

    Ok(message_payload(stored))
}

async fn reply_snapshot(
    ctx: &ApiContext,
    chat_id: ChatId,
    original_id: MessageId,
) -> Result<ReplyPreview, ApiError> {
    let original = ctx
        .storage
        .load_message(original_id)
        .await
        .map_err(internal)?
        .filter(|message| message.chat_id == chat_id)
        .ok_or_else(|| ApiError::not_found("replied-to message not found"))?;
    Ok(ReplyPreview {
        message_id: original.message_id,
        sender_id: original.sender_id,
        sender_name: original.sender_name,
        kind: original.body.kind(),
        preview: original.body.preview(),
        sent_at: original.sent_at,
    })
}

/// The chat log in ascending order. With `limit`, only the newest messages.
pub async fn list_messages(
    ctx: &ApiContext,
    viewer: UserId,
    chat_id: ChatId,
    limit: Option<u32>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(ctx, chat_id, viewer).await?;
    let messages = ctx
        .storage
        .list_chat_messages(chat_id, limit)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn subscribe_messages(
    ctx: &ApiContext,
    viewer: UserId,
    chat_id: ChatId,
) -> Result<Subscription<Vec<MessagePayload>>, ApiError> {
    ensure_participant(ctx, chat_id, viewer).await?;
    let loader = ctx.clone();
    Ok(ctx.feed.watch(Topic::ChatMessages { chat_id }, move || {
        let ctx = loader.clone();
        async move { list_messages(&ctx, viewer, chat_id, None).await }
    }))
}

pub async fn add_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    message_id: MessageId,
    emoji: &str,
) -> Result<MessagePayload, ApiError> {
    let emoji = validate_emoji(emoji)?;
    ensure_message_in_chat(ctx, user_id, chat_id, message_id).await?;
    let changed = ctx
        .storage
        .add_reaction(message_id, emoji, user_id)
        .await
        .map_err(internal)?;
    reload_after_update(ctx, chat_id, message_id, changed).await
}

pub async fn remove_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    message_id: MessageId,
    emoji: &str,
) -> Result<MessagePayload, ApiError> {
    let emoji = validate_emoji(emoji)?;
    ensure_message_in_chat(ctx, user_id, chat_id, message_id).await?;
    let changed = ctx
        .storage
        .remove_reaction(message_id, emoji, user_id)
        .await
        .map_err(internal)?;
    reload_after_update(ctx, chat_id, message_id, changed).await
}

/// Marks the chat read for `user_id`, up to and including `up_to` when given.
/// Returns how many messages gained the reader.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    up_to: Option<MessageId>,
) -> Result<u64, ApiError> {
    ensure_participant(ctx, chat_id, user_id).await?;
    let marked = ctx
        .storage
        .mark_messages_read(chat_id, user_id, up_to, Utc::now())
        .await
        .map_err(internal)?;
    if marked > 0 {
        ctx.feed.publish(Topic::ChatMessages { chat_id });
    }
    Ok(marked)
}

fn validate_emoji(emoji: &str) -> Result<&str, ApiError> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(ApiError::invalid_argument("emoji is required"));
    }
    if emoji.len() > MAX_EMOJI_BYTES {
        return Err(ApiError::invalid_argument("emoji is too long"));
    }
    Ok(emoji)
}

async fn ensure_message_in_chat(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    ensure_participant(ctx, chat_id, user_id).await?;
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?;
    match message {
        Some(message) if message.chat_id == chat_id => Ok(()),
        _ => Err(ApiError::not_found("message not found")),
    }
}

async fn reload_after_update(
    ctx: &ApiContext,
    chat_id: ChatId,
    message_id: MessageId,
    changed: bool,
) -> Result<MessagePayload, ApiError> {
    if changed {
        ctx.feed.publish(Topic::ChatMessages { chat_id });
    }
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    Ok(message_payload(message))
}

pub(crate) fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        sender_name: message.sender_name,
        body: message.body,
        sent_at: message.sent_at,
        reactions: message.reactions,
        read_by: message.read_by,
        reply_to: message.reply_to,
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
