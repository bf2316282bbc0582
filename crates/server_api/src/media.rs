use shared::{
    domain::{ChatId, MediaId, UserId},
    error::ApiError,
    protocol::MediaRef,
};
use storage::StoredMedia;
use tracing::info;

use crate::{ensure_participant, internal, ApiContext};

const MAX_FILENAME_BYTES: usize = 180;

pub fn media_url(media_id: MediaId) -> String {
    format!("/media/{media_id}")
}

/// Stores an attachment for a chat. The returned url is what image, voice,
/// file and video message bodies point at.
pub async fn upload_media(
    ctx: &ApiContext,
    uploader_id: UserId,
    chat_id: ChatId,
    bytes: &[u8],
    filename: Option<&str>,
    mime_type: Option<&str>,
) -> Result<MediaRef, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::invalid_argument("attachment body cannot be empty"));
    }
    if bytes.len() > ctx.config.max_media_bytes {
        return Err(ApiError::invalid_argument(format!(
            "attachment exceeds {} bytes",
            ctx.config.max_media_bytes
        )));
    }

    let filename = filename.map(str::trim).filter(|name| !name.is_empty());
    if let Some(name) = filename {
        if name.len() > MAX_FILENAME_BYTES {
            return Err(ApiError::invalid_argument("filename is too long"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(ApiError::invalid_argument(
                "filename must not contain path separators",
            ));
        }
    }
    let mime_type = mime_type.map(str::trim).filter(|mime| !mime.is_empty());

    ensure_participant(ctx, chat_id, uploader_id).await?;

    let media_id = ctx
        .storage
        .store_media(uploader_id, chat_id, bytes, mime_type, filename)
        .await
        .map_err(internal)?;
    info!(
        media_id = media_id.0,
        chat_id = chat_id.0,
        uploader_id = uploader_id.0,
        size_bytes = bytes.len(),
        "media stored"
    );
    Ok(MediaRef {
        media_id,
        url: media_url(media_id),
        size_bytes: bytes.len() as u64,
    })
}

/// Only participants of the chat the blob was uploaded to may read it.
pub async fn download_media(
    ctx: &ApiContext,
    media_id: MediaId,
    viewer: UserId,
) -> Result<StoredMedia, ApiError> {
    let media = ctx
        .storage
        .load_media(media_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("media not found"))?;
    ensure_participant(ctx, media.chat_id, viewer).await?;
    Ok(media)
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
