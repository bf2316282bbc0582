use chrono::{DateTime, Utc};
use shared::{
    domain::{StatusId, UserId},
    error::ApiError,
    protocol::{StatusPayload, SweepReport, Topic},
};
use storage::StoredStatus;
use tracing::info;

use crate::{ensure_user, feed::Subscription, internal, ApiContext};

const MAX_STATUS_CHARS: usize = 700;

pub async fn create_status(
    ctx: &ApiContext,
    author_id: UserId,
    content: &str,
    media_url: Option<&str>,
) -> Result<StatusId, ApiError> {
    create_status_at(ctx, author_id, content, media_url, Utc::now()).await
}

/// Posts a status that stays visible until `now + status_ttl`.
pub async fn create_status_at(
    ctx: &ApiContext,
    author_id: UserId,
    content: &str,
    media_url: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StatusId, ApiError> {
    ensure_user(ctx, author_id).await?;
    let content = content.trim();
    let media_url = media_url.map(str::trim).filter(|url| !url.is_empty());
    if content.is_empty() && media_url.is_none() {
        return Err(ApiError::invalid_argument("status needs text or media"));
    }
    if content.chars().count() > MAX_STATUS_CHARS {
        return Err(ApiError::invalid_argument("status text is too long"));
    }

    let expires_at = now + ctx.config.status_ttl;
    let status_id = ctx
        .storage
        .insert_status(author_id, content, media_url, now, expires_at)
        .await
        .map_err(internal)?;
    info!(status_id = status_id.0, author_id = author_id.0, %expires_at, "status posted");
    ctx.feed.publish(Topic::Statuses);
    Ok(status_id)
}

pub async fn status_feed(ctx: &ApiContext, viewer: UserId) -> Result<Vec<StatusPayload>, ApiError> {
    status_feed_at(ctx, viewer, Utc::now()).await
}

/// Live statuses by the viewer and their contacts, newest first. A status is
/// gone from the moment `now` reaches its `expires_at`, swept or not.
pub async fn status_feed_at(
    ctx: &ApiContext,
    viewer: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<StatusPayload>, ApiError> {
    ensure_user(ctx, viewer).await?;
    let statuses = ctx
        .storage
        .list_status_feed(viewer, now)
        .await
        .map_err(internal)?;
    Ok(statuses.into_iter().map(status_payload).collect())
}

pub async fn mark_status_viewed(
    ctx: &ApiContext,
    status_id: StatusId,
    viewer: UserId,
) -> Result<(), ApiError> {
    ensure_user(ctx, viewer).await?;
    let author = ctx
        .storage
        .status_author(status_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("status not found"))?;
    if author != viewer && !ctx.storage.is_contact(viewer, author).await.map_err(internal)? {
        return Err(ApiError::permission_denied(
            "only contacts can view this status",
        ));
    }

    let added = ctx
        .storage
        .add_status_view(status_id, viewer)
        .await
        .map_err(internal)?;
    if added {
        ctx.feed.publish(Topic::Statuses);
    }
    Ok(())
}

/// Deletes every status whose `expires_at` has passed.
pub async fn sweep_expired_statuses(
    ctx: &ApiContext,
    now: DateTime<Utc>,
) -> Result<SweepReport, ApiError> {
    let deleted_count = ctx
        .storage
        .delete_expired_statuses(now)
        .await
        .map_err(internal)?;
    info!(deleted_count, "expired statuses swept");
    if deleted_count > 0 {
        ctx.feed.publish(Topic::Statuses);
    }
    Ok(SweepReport { deleted_count })
}

pub async fn subscribe_statuses(
    ctx: &ApiContext,
    viewer: UserId,
) -> Result<Subscription<Vec<StatusPayload>>, ApiError> {
    ensure_user(ctx, viewer).await?;
    let loader = ctx.clone();
    Ok(ctx.feed.watch(Topic::Statuses, move || {
        let ctx = loader.clone();
        async move { status_feed(&ctx, viewer).await }
    }))
}

fn status_payload(status: StoredStatus) -> StatusPayload {
    StatusPayload {
        status_id: status.status_id,
        author_id: status.author_id,
        author_display_name: status.author_display_name,
        content: status.content,
        media_url: status.media_url,
        created_at: status.created_at,
        expires_at: status.expires_at,
        viewed_by: status.viewed_by,
    }
}

#[cfg(test)]
#[path = "tests/statuses_tests.rs"]
mod tests;
