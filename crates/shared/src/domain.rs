use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);
id_newtype!(StatusId);
id_newtype!(MediaId);

pub const REPLY_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    File,
    Video,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
            MessageKind::Video => "video",
        }
    }
}

/// Content of a chat message. Each kind carries only the fields it renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Voice {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
    },
    File {
        url: String,
        filename: String,
        size_bytes: u64,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        MessageBody::Text {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::Voice { .. } => MessageKind::Voice,
            MessageBody::File { .. } => MessageKind::File,
            MessageBody::Video { .. } => MessageKind::Video,
        }
    }

    /// Empty text or a media body without a url cannot be delivered.
    pub fn is_deliverable(&self) -> bool {
        match self {
            MessageBody::Text { content } => !content.trim().is_empty(),
            MessageBody::Image { url, .. }
            | MessageBody::Voice { url, .. }
            | MessageBody::Video { url, .. } => !url.trim().is_empty(),
            MessageBody::File { url, filename, .. } => {
                !url.trim().is_empty() && !filename.trim().is_empty()
            }
        }
    }

    /// Short one-line rendering used for chat list previews, reply bubbles
    /// and push notification bodies.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { content } => truncate_chars(content.trim(), REPLY_PREVIEW_CHARS),
            MessageBody::Image { .. } => "Image".to_string(),
            MessageBody::Voice { .. } => "Voice message".to_string(),
            MessageBody::File { filename, .. } => format!("File: {filename}"),
            MessageBody::Video { .. } => "Video".to_string(),
        }
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Copy of the replied-to message taken at send time. It is never refreshed,
/// so a reply still renders after the original is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    pub preview: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptMark {
    /// Only the sender has read the message.
    Sent,
    /// At least one other participant has read it.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactState {
    None,
    Pending,
    Mutual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_preview_truncates_on_char_boundary() {
        let body = MessageBody::text("é".repeat(60));
        let preview = body.preview();
        assert_eq!(preview.chars().count(), REPLY_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn media_previews_use_kind_labels() {
        let voice = MessageBody::Voice {
            url: "/media/1".into(),
            duration_secs: Some(4),
        };
        assert_eq!(voice.preview(), "Voice message");
        assert_eq!(voice.kind(), MessageKind::Voice);
    }

    #[test]
    fn body_serializes_with_type_tag() {
        let json = serde_json::to_value(MessageBody::text("hi")).expect("json");
        assert_eq!(json["type"], "text");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn blank_text_is_not_deliverable() {
        assert!(!MessageBody::text("   ").is_deliverable());
        assert!(MessageBody::text("hey").is_deliverable());
    }
}
