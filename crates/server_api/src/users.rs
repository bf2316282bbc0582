use shared::{domain::UserId, error::ApiError, protocol::UserProfile};
use tracing::info;

use crate::{ensure_user, internal, ApiContext};

const MAX_DISPLAY_NAME_CHARS: usize = 64;
const MAX_DEVICE_TOKEN_BYTES: usize = 4096;

/// Find-or-create by identity (phone number or email). Re-registering an
/// existing identity keeps the stored display name.
pub async fn register_user(
    ctx: &ApiContext,
    identity: &str,
    display_name: &str,
) -> Result<UserProfile, ApiError> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(ApiError::invalid_argument("identity is required"));
    }
    let display_name = validate_display_name(display_name)?;

    let user_id = ctx
        .storage
        .create_user(identity, display_name)
        .await
        .map_err(internal)?;
    info!(user_id = user_id.0, "user registered");
    get_profile(ctx, user_id).await
}

pub async fn get_profile(ctx: &ApiContext, user_id: UserId) -> Result<UserProfile, ApiError> {
    let user = ctx
        .storage
        .load_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(UserProfile {
        user_id: user.user_id,
        identity: user.identity,
        display_name: user.display_name,
        avatar_url: user.avatar_url,
        settings: user.settings,
        created_at: user.created_at,
    })
}

/// Fields left as `None` keep their current value.
pub async fn update_profile(
    ctx: &ApiContext,
    user_id: UserId,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
) -> Result<UserProfile, ApiError> {
    ensure_user(ctx, user_id).await?;
    let display_name = display_name.map(validate_display_name).transpose()?;
    ctx.storage
        .update_profile(user_id, display_name, avatar_url.map(str::trim))
        .await
        .map_err(internal)?;
    get_profile(ctx, user_id).await
}

/// Replaces the settings bag wholesale.
pub async fn update_settings(
    ctx: &ApiContext,
    user_id: UserId,
    settings: serde_json::Value,
) -> Result<UserProfile, ApiError> {
    ensure_user(ctx, user_id).await?;
    if !settings.is_object() {
        return Err(ApiError::invalid_argument("settings must be a JSON object"));
    }
    ctx.storage
        .update_settings(user_id, &settings)
        .await
        .map_err(internal)?;
    get_profile(ctx, user_id).await
}

pub async fn register_device_token(
    ctx: &ApiContext,
    user_id: UserId,
    token: &str,
) -> Result<(), ApiError> {
    ensure_user(ctx, user_id).await?;
    let token = validate_token(token)?;
    let added = ctx
        .storage
        .add_device_token(user_id, token)
        .await
        .map_err(internal)?;
    if added {
        info!(user_id = user_id.0, "device token registered");
    }
    Ok(())
}

pub async fn remove_device_token(
    ctx: &ApiContext,
    user_id: UserId,
    token: &str,
) -> Result<(), ApiError> {
    ensure_user(ctx, user_id).await?;
    let token = validate_token(token)?;
    ctx.storage
        .remove_device_token(user_id, token)
        .await
        .map_err(internal)?;
    Ok(())
}

fn validate_display_name(display_name: &str) -> Result<&str, ApiError> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::invalid_argument("display name is required"));
    }
    if display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(ApiError::invalid_argument("display name is too long"));
    }
    Ok(display_name)
}

fn validate_token(token: &str) -> Result<&str, ApiError> {
    let token = token.trim();
    if token.is_empty() || token.len() > MAX_DEVICE_TOKEN_BYTES {
        return Err(ApiError::invalid_argument("invalid device token"));
    }
    Ok(token)
}

#[cfg(test)]
#[path = "tests/users_tests.rs"]
mod tests;
