use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, UserId},
    error::ApiError,
    protocol::{SweepReport, Topic, TypingUser},
};
use tracing::{debug, info, warn};

use crate::{ensure_participant, feed::Subscription, internal, ApiContext};

pub async fn set_typing(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
    is_typing: bool,
) -> Result<(), ApiError> {
    set_typing_at(ctx, chat_id, user_id, is_typing, Utc::now()).await
}

/// `true` upserts the record with `now`; `false` deletes it.
pub async fn set_typing_at(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
    is_typing: bool,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    ensure_participant(ctx, chat_id, user_id).await?;
    if is_typing {
        ctx.storage
            .upsert_typing(chat_id, user_id, now)
            .await
            .map_err(internal)?;
    } else {
        ctx.storage
            .clear_typing(chat_id, user_id)
            .await
            .map_err(internal)?;
    }
    debug!(chat_id = chat_id.0, user_id = user_id.0, is_typing, "typing updated");
    ctx.feed.publish(Topic::ChatTyping { chat_id });
    Ok(())
}

pub async fn typing_users(
    ctx: &ApiContext,
    chat_id: ChatId,
    viewer: UserId,
) -> Result<Vec<TypingUser>, ApiError> {
    typing_users_at(ctx, chat_id, viewer, Utc::now()).await
}

/// Who is typing in the chat as seen by `viewer`: fresh records only, never
/// the viewer themselves.
pub async fn typing_users_at(
    ctx: &ApiContext,
    chat_id: ChatId,
    viewer: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<TypingUser>, ApiError> {
    ensure_participant(ctx, chat_id, viewer).await?;
    let fresh_since = now - ctx.config.typing_stale_after;
    let rows = ctx
        .storage
        .list_typing(chat_id, fresh_since)
        .await
        .map_err(internal)?;
    Ok(rows
        .into_iter()
        .filter(|(user_id, _)| *user_id != viewer)
        .map(|(user_id, since)| TypingUser { user_id, since })
        .collect())
}

pub async fn subscribe_typing(
    ctx: &ApiContext,
    chat_id: ChatId,
    viewer: UserId,
) -> Result<Subscription<Vec<TypingUser>>, ApiError> {
    ensure_participant(ctx, chat_id, viewer).await?;
    let loader = ctx.clone();
    Ok(ctx.feed.watch_expiring(Topic::ChatTyping { chat_id }, move || {
        let ctx = loader.clone();
        async move {
            let now = Utc::now();
            let users = typing_users_at(&ctx, chat_id, viewer, now).await?;
            let valid_for = time_until_stale(&users, ctx.config.typing_stale_after, now);
            Ok((users, valid_for))
        }
    }))
}

/// Time until the oldest record in `users` turns stale, so a subscriber sees
/// it disappear without waiting for a sweep.
fn time_until_stale(
    users: &[TypingUser],
    stale_after: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<std::time::Duration> {
    let oldest = users.iter().map(|user| user.since).min()?;
    // Records are stored in whole milliseconds and stay fresh at the threshold.
    let stale_at = oldest + stale_after + chrono::Duration::milliseconds(1);
    Some((stale_at - now).to_std().unwrap_or_default())
}

/// Deletes typing records older than the stale threshold, one chat at a time.
/// A chat that fails is logged and skipped.
pub async fn sweep_stale_typing(
    ctx: &ApiContext,
    now: DateTime<Utc>,
) -> Result<SweepReport, ApiError> {
    let cutoff = now - ctx.config.typing_stale_after;
    let chat_ids = ctx.storage.list_chat_ids().await.map_err(internal)?;

    let mut deleted_count = 0;
    for chat_id in chat_ids {
        match ctx.storage.delete_stale_typing(chat_id, cutoff).await {
            Ok(0) => {}
            Ok(removed) => {
                deleted_count += removed;
                ctx.feed.publish(Topic::ChatTyping { chat_id });
            }
            Err(err) => warn!(chat_id = chat_id.0, %err, "typing sweep failed for chat"),
        }
    }

    info!(deleted_count, "stale typing indicators swept");
    Ok(SweepReport { deleted_count })
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
