use shared::{
    domain::{ContactState, UserId},
    error::ApiError,
    protocol::{ContactsSummary, Topic},
};
use tracing::info;

use crate::{ensure_user, feed::Subscription, internal, ApiContext};

/// Records `requester` in the target's pending set.
pub async fn send_contact_request(
    ctx: &ApiContext,
    requester: UserId,
    target: UserId,
) -> Result<(), ApiError> {
    ensure_user(ctx, requester).await?;
    if requester == target {
        return Err(ApiError::invalid_argument(
            "cannot send a contact request to yourself",
        ));
    }
    let target_exists = ctx.storage.user_exists(target).await.map_err(internal)?;
    if !target_exists {
        return Err(ApiError::not_found("user not found"));
    }
    if ctx
        .storage
        .is_contact(requester, target)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::already_exists("already contacts"));
    }

    let added = ctx
        .storage
        .add_pending_request(target, requester)
        .await
        .map_err(internal)?;
    if !added {
        return Err(ApiError::already_exists("contact request already sent"));
    }

    info!(requester = requester.0, target = target.0, "contact request sent");
    ctx.feed.publish(Topic::UserContacts { user_id: target });
    Ok(())
}

/// Makes the pair mutual contacts and clears the request in one transaction.
pub async fn accept_contact_request(
    ctx: &ApiContext,
    accepter: UserId,
    requester: UserId,
) -> Result<(), ApiError> {
    ensure_user(ctx, accepter).await?;
    let accepted = ctx
        .storage
        .accept_contact_request(accepter, requester)
        .await
        .map_err(internal)?;
    if !accepted {
        return Err(ApiError::not_found("no pending request from this user"));
    }

    info!(accepter = accepter.0, requester = requester.0, "contact request accepted");
    ctx.feed.publish(Topic::UserContacts { user_id: accepter });
    ctx.feed.publish(Topic::UserContacts { user_id: requester });
    ctx.feed.publish(Topic::Statuses);
    Ok(())
}

/// Drops the request. The requester is not told, and rejecting twice is fine.
pub async fn reject_contact_request(
    ctx: &ApiContext,
    accepter: UserId,
    requester: UserId,
) -> Result<(), ApiError> {
    ensure_user(ctx, accepter).await?;
    let removed = ctx
        .storage
        .remove_pending_request(accepter, requester)
        .await
        .map_err(internal)?;
    if removed {
        ctx.feed.publish(Topic::UserContacts { user_id: accepter });
    }
    Ok(())
}

pub async fn list_contacts(ctx: &ApiContext, user_id: UserId) -> Result<ContactsSummary, ApiError> {
    ensure_user(ctx, user_id).await?;
    let contacts = ctx.storage.list_contacts(user_id).await.map_err(internal)?;
    let pending_requests = ctx
        .storage
        .list_pending_requests(user_id)
        .await
        .map_err(internal)?;
    Ok(ContactsSummary {
        contacts,
        pending_requests,
    })
}

/// Relationship from `user_id`'s side: mutual, a request sent and waiting on
/// `other`, or nothing.
pub async fn contact_state(
    ctx: &ApiContext,
    user_id: UserId,
    other: UserId,
) -> Result<ContactState, ApiError> {
    if ctx.storage.is_contact(user_id, other).await.map_err(internal)? {
        return Ok(ContactState::Mutual);
    }
    if ctx
        .storage
        .has_pending_request(other, user_id)
        .await
        .map_err(internal)?
    {
        return Ok(ContactState::Pending);
    }
    Ok(ContactState::None)
}

pub async fn subscribe_contacts(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Subscription<ContactsSummary>, ApiError> {
    ensure_user(ctx, user_id).await?;
    let loader = ctx.clone();
    Ok(ctx.feed.watch(Topic::UserContacts { user_id }, move || {
        let ctx = loader.clone();
        async move { list_contacts(&ctx, user_id).await }
    }))
}

#[cfg(test)]
#[path = "tests/contacts_tests.rs"]
mod tests;
