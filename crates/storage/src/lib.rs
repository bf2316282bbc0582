use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, MediaId, MessageBody, MessageId, ReplyPreview, StatusId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub identity: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredLatestMessage {
    pub preview: String,
    pub sender_id: UserId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub is_group_chat: bool,
    pub chat_name: String,
    pub participants: Vec<UserId>,
    pub admins: Vec<UserId>,
    pub latest_message: Option<StoredLatestMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChat<'a> {
    pub participants: &'a [UserId],
    pub is_group_chat: bool,
    pub chat_name: &'a str,
    pub admins: &'a [UserId],
    /// Set for direct chats only. Unique across chats, so a second insert for
    /// the same pair resolves to the existing row.
    pub direct_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub body: MessageBody,
    pub reply_to: Option<ReplyPreview>,
    pub sent_at: DateTime<Utc>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub read_by: BTreeSet<UserId>,
}

#[derive(Debug, Clone)]
pub struct StoredStatus {
    pub status_id: StatusId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub content: String,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub viewed_by: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub media_id: MediaId,
    pub uploader_id: UserId,
    pub chat_id: ChatId,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub size_bytes: u64,
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Order-independent key for a two-person chat.
pub fn direct_chat_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", low.0, high.0)
}

const MESSAGE_COLUMNS: &str = "m.id, m.chat_id, m.sender_id, u.display_name, m.body, m.reply_to, m.sent_at_ms";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, identity: &str, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (identity, display_name, created_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(identity) DO UPDATE SET identity=excluded.identity
             RETURNING id",
        )
        .bind(identity)
        .bind(display_name)
        .bind(to_millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn load_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, identity, display_name, avatar_url, settings, created_at_ms FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<StoredUser> {
            let settings_raw = r.get::<String, _>(4);
            let settings = serde_json::from_str(&settings_raw)
                .with_context(|| format!("corrupt settings for user {}", user_id.0))?;
            Ok(StoredUser {
                user_id: UserId(r.get::<i64, _>(0)),
                identity: r.get::<String, _>(1),
                display_name: r.get::<String, _>(2),
                avatar_url: r.get::<Option<String>, _>(3),
                settings,
                created_at: from_millis(r.get::<i64, _>(5)),
            })
        })
        .transpose()
    }

    pub async fn display_name_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users
             SET display_name = COALESCE(?, display_name),
                 avatar_url = COALESCE(?, avatar_url)
             WHERE id = ?",
        )
        .bind(display_name)
        .bind(avatar_url)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_settings(
        &self,
        user_id: UserId,
        settings: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET settings = ? WHERE id = ?")
            .bind(serde_json::to_string(settings)?)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_device_token(&self, user_id: UserId, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO device_tokens (user_id, token, created_at_ms) VALUES (?, ?, ?)",
        )
        .bind(user_id.0)
        .bind(token)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_device_token(&self, user_id: UserId, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE user_id = ? AND token = ?")
            .bind(user_id.0)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_device_tokens(&self, user_id: UserId) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT token FROM device_tokens WHERE user_id = ? ORDER BY token")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn device_tokens_for_users(&self, users: &[UserId]) -> Result<Vec<(UserId, String)>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT user_id, token FROM device_tokens WHERE user_id IN (");
        let mut separated = builder.separated(", ");
        for user_id in users {
            separated.push_bind(user_id.0);
        }
        separated.push_unseparated(") ORDER BY user_id, token");
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn is_contact(&self, user_id: UserId, other: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM contacts WHERE user_id = ? AND contact_id = ?")
            .bind(user_id.0)
            .bind(other.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn has_pending_request(&self, target_id: UserId, requester_id: UserId) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM pending_requests WHERE target_id = ? AND requester_id = ?")
                .bind(target_id.0)
                .bind(requester_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn add_pending_request(&self, target_id: UserId, requester_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO pending_requests (target_id, requester_id, created_at_ms) VALUES (?, ?, ?)",
        )
        .bind(target_id.0)
        .bind(requester_id.0)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_pending_request(
        &self,
        target_id: UserId,
        requester_id: UserId,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM pending_requests WHERE target_id = ? AND requester_id = ?")
                .bind(target_id.0)
                .bind(requester_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops the pending request from `requester` to `accepter` and makes the
    /// pair mutual contacts, all in one transaction. Returns `false` without
    /// writing anything when no request was pending.
    pub async fn accept_contact_request(
        &self,
        accepter: UserId,
        requester: UserId,
    ) -> Result<bool> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let cleared =
            sqlx::query("DELETE FROM pending_requests WHERE target_id = ? AND requester_id = ?")
                .bind(accepter.0)
                .bind(requester.0)
                .execute(&mut *tx)
                .await
                .context("failed to clear pending request")?;
        if cleared.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        for (user_id, contact_id) in [(requester, accepter), (accepter, requester)] {
            sqlx::query(
                "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at_ms) VALUES (?, ?, ?)",
            )
            .bind(user_id.0)
            .bind(contact_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to add contact")?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn list_contacts(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT contact_id FROM contacts WHERE user_id = ? ORDER BY contact_id")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn list_pending_requests(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT requester_id FROM pending_requests WHERE target_id = ? ORDER BY created_at_ms, requester_id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    /// Inserts a chat with its participants and admins. Returns the chat id and
    /// whether a new row was created; for a direct chat whose pair already has a
    /// chat, the existing id is returned instead.
    pub async fn create_chat(&self, chat: NewChat<'_>) -> Result<(ChatId, bool)> {
        let now = to_millis(chat.created_at);
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO chats (is_group_chat, chat_name, direct_key, created_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(direct_key) DO NOTHING
             RETURNING id",
        )
        .bind(chat.is_group_chat)
        .bind(chat.chat_name)
        .bind(chat.direct_key.as_deref())
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            let existing = sqlx::query("SELECT id FROM chats WHERE direct_key = ?")
                .bind(chat.direct_key.as_deref())
                .fetch_one(&mut *tx)
                .await
                .context("direct chat conflict without an existing row")?;
            tx.commit().await?;
            return Ok((ChatId(existing.get::<i64, _>(0)), false));
        };
        let chat_id = row.get::<i64, _>(0);

        for user_id in chat.participants {
            sqlx::query("INSERT OR IGNORE INTO chat_participants (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?;
        }
        for user_id in chat.admins {
            sqlx::query("INSERT OR IGNORE INTO chat_admins (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok((ChatId(chat_id), true))
    }

    pub async fn load_chat(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query(
            "SELECT id, is_group_chat, chat_name, latest_preview, latest_sender_id, latest_at_ms, created_at_ms, updated_at_ms
             FROM chats WHERE id = ?",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.chat_from_row(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(
            "SELECT c.id, c.is_group_chat, c.chat_name, c.latest_preview, c.latest_sender_id, c.latest_at_ms, c.created_at_ms, c.updated_at_ms
             FROM chats c
             INNER JOIN chat_participants p ON p.chat_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.updated_at_ms DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut chats = Vec::with_capacity(rows.len());
        for row in rows {
            chats.push(self.chat_from_row(row).await?);
        }
        Ok(chats)
    }

    pub async fn list_chat_ids(&self) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT id FROM chats ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| ChatId(r.get::<i64, _>(0))).collect())
    }

    pub async fn chat_participants(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let rows =
            sqlx::query("SELECT user_id FROM chat_participants WHERE chat_id = ? ORDER BY user_id")
                .bind(chat_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn update_latest_message(
        &self,
        chat_id: ChatId,
        preview: &str,
        sender_id: UserId,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let at = to_millis(sent_at);
        sqlx::query(
            "UPDATE chats
             SET latest_preview = ?, latest_sender_id = ?, latest_at_ms = ?, updated_at_ms = MAX(updated_at_ms, ?)
             WHERE id = ?",
        )
        .bind(preview)
        .bind(sender_id.0)
        .bind(at)
        .bind(at)
        .bind(chat_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chat_from_row(&self, r: SqliteRow) -> Result<StoredChat> {
        let chat_id = ChatId(r.get::<i64, _>(0));
        let participants = self.chat_participants(chat_id).await?;
        let admin_rows =
            sqlx::query("SELECT user_id FROM chat_admins WHERE chat_id = ? ORDER BY user_id")
                .bind(chat_id.0)
                .fetch_all(&self.pool)
                .await?;
        let latest_message = match (
            r.get::<Option<String>, _>(3),
            r.get::<Option<i64>, _>(4),
            r.get::<Option<i64>, _>(5),
        ) {
            (Some(preview), Some(sender_id), Some(at)) => Some(StoredLatestMessage {
                preview,
                sender_id: UserId(sender_id),
                sent_at: from_millis(at),
            }),
            _ => None,
        };
        Ok(StoredChat {
            chat_id,
            is_group_chat: r.get::<bool, _>(1),
            chat_name: r.get::<String, _>(2),
            participants,
            admins: admin_rows
                .into_iter()
                .map(|a| UserId(a.get::<i64, _>(0)))
                .collect(),
            latest_message,
            created_at: from_millis(r.get::<i64, _>(6)),
            updated_at: from_millis(r.get::<i64, _>(7)),
        })
    }

    /// Appends a message to the chat log. `sent_at` is the later of `now` and
    /// one millisecond past the chat's newest message, so the log order never
    /// goes backwards. The sender is recorded as the first reader.
    pub async fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        body: &MessageBody,
        reply_to: Option<&ReplyPreview>,
        now: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let body_json = serde_json::to_string(body)?;
        let reply_json = reply_to.map(serde_json::to_string).transpose()?;
        let now_ms = to_millis(now);

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_id, kind, body, reply_to, sent_at_ms)
             VALUES (?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(sent_at_ms) + 1 FROM messages WHERE chat_id = ?), 0)))
             RETURNING id, sent_at_ms",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(body.kind().as_str())
        .bind(&body_json)
        .bind(reply_json.as_deref())
        .bind(now_ms)
        .bind(chat_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = rec.get::<i64, _>(0);
        let sent_at_ms = rec.get::<i64, _>(1);

        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at_ms) VALUES (?, ?, ?)")
            .bind(message_id)
            .bind(sender_id.0)
            .bind(sent_at_ms)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let sender_name = self.display_name_for_user(sender_id).await?;
        Ok(StoredMessage {
            message_id: MessageId(message_id),
            chat_id,
            sender_id,
            sender_name,
            body: body.clone(),
            reply_to: reply_to.cloned(),
            sent_at: from_millis(sent_at_ms),
            reactions: BTreeMap::new(),
            read_by: BTreeSet::from([sender_id]),
        })
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON u.id = m.sender_id WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;

        let reactions = sqlx::query(
            "SELECT emoji, user_id FROM message_reactions WHERE message_id = ? ORDER BY emoji, user_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in reactions {
            message
                .reactions
                .entry(r.get::<String, _>(0))
                .or_default()
                .insert(UserId(r.get::<i64, _>(1)));
        }
        let reads = sqlx::query("SELECT user_id FROM message_reads WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_all(&self.pool)
            .await?;
        message.read_by = reads.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect();
        Ok(Some(message))
    }

    /// Messages of a chat in ascending log order. With a limit, the newest
    /// `limit` messages are returned, still oldest first.
    pub async fn list_chat_messages(
        &self,
        chat_id: ChatId,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = ?
             ORDER BY m.sent_at_ms DESC, m.id DESC
             LIMIT ?"
        ))
        .bind(chat_id.0)
        .bind(limit.map_or(-1, i64::from))
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        let mut index: HashMap<MessageId, usize> = HashMap::with_capacity(messages.len());
        for (i, message) in messages.iter().enumerate() {
            index.insert(message.message_id, i);
        }

        let reactions = sqlx::query(
            "SELECT r.message_id, r.emoji, r.user_id
             FROM message_reactions r INNER JOIN messages m ON m.id = r.message_id
             WHERE m.chat_id = ?",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in reactions {
            if let Some(&i) = index.get(&MessageId(r.get::<i64, _>(0))) {
                messages[i]
                    .reactions
                    .entry(r.get::<String, _>(1))
                    .or_default()
                    .insert(UserId(r.get::<i64, _>(2)));
            }
        }

        let reads = sqlx::query(
            "SELECT r.message_id, r.user_id
             FROM message_reads r INNER JOIN messages m ON m.id = r.message_id
             WHERE m.chat_id = ?",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in reads {
            if let Some(&i) = index.get(&MessageId(r.get::<i64, _>(0))) {
                messages[i].read_by.insert(UserId(r.get::<i64, _>(1)));
            }
        }

        Ok(messages)
    }

    pub async fn add_reaction(&self, message_id: MessageId, emoji: &str, user_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reactions (message_id, emoji, user_id) VALUES (?, ?, ?)",
        )
        .bind(message_id.0)
        .bind(emoji)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
        user_id: UserId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND emoji = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(emoji)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Adds `user_id` to the readers of every message in the chat, optionally
    /// only up to `up_to`. Returns how many messages were newly marked.
    pub async fn mark_messages_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        up_to: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at_ms)
             SELECT id, ?, ? FROM messages WHERE chat_id = ? AND (? IS NULL OR id <= ?)",
        )
        .bind(user_id.0)
        .bind(to_millis(now))
        .bind(chat_id.0)
        .bind(up_to.map(|m| m.0))
        .bind(up_to.map(|m| m.0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_typing(&self, chat_id: ChatId, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO typing_indicators (chat_id, user_id, updated_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET updated_at_ms = excluded.updated_at_ms",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_typing(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM typing_indicators WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Typing records updated at or after `fresh_since`.
    pub async fn list_typing(
        &self,
        chat_id: ChatId,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT user_id, updated_at_ms FROM typing_indicators
             WHERE chat_id = ? AND updated_at_ms >= ?
             ORDER BY user_id",
        )
        .bind(chat_id.0)
        .bind(to_millis(fresh_since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), from_millis(r.get::<i64, _>(1))))
            .collect())
    }

    pub async fn delete_stale_typing(&self, chat_id: ChatId, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM typing_indicators WHERE chat_id = ? AND updated_at_ms < ?")
                .bind(chat_id.0)
                .bind(to_millis(cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_status(
        &self,
        author_id: UserId,
        content: &str,
        media_url: Option<&str>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<StatusId> {
        let rec = sqlx::query(
            "INSERT INTO statuses (author_id, content, media_url, created_at_ms, expires_at_ms)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(author_id.0)
        .bind(content)
        .bind(media_url)
        .bind(to_millis(created_at))
        .bind(to_millis(expires_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(StatusId(rec.get::<i64, _>(0)))
    }

    /// Unexpired statuses written by `viewer` or one of their contacts,
    /// newest first.
    pub async fn list_status_feed(
        &self,
        viewer: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredStatus>> {
        let rows = sqlx::query(
            "SELECT s.id, s.author_id, u.display_name, s.content, s.media_url, s.created_at_ms, s.expires_at_ms
             FROM statuses s INNER JOIN users u ON u.id = s.author_id
             WHERE s.expires_at_ms > ?
               AND (s.author_id = ? OR s.author_id IN (SELECT contact_id FROM contacts WHERE user_id = ?))
             ORDER BY s.created_at_ms DESC, s.id DESC",
        )
        .bind(to_millis(now))
        .bind(viewer.0)
        .bind(viewer.0)
        .fetch_all(&self.pool)
        .await?;

        let mut statuses = Vec::with_capacity(rows.len());
        for r in rows {
            let status_id = StatusId(r.get::<i64, _>(0));
            statuses.push(StoredStatus {
                status_id,
                author_id: UserId(r.get::<i64, _>(1)),
                author_display_name: r.get::<String, _>(2),
                content: r.get::<String, _>(3),
                media_url: r.get::<Option<String>, _>(4),
                created_at: from_millis(r.get::<i64, _>(5)),
                expires_at: from_millis(r.get::<i64, _>(6)),
                viewed_by: self.status_viewers(status_id).await?,
            });
        }
        Ok(statuses)
    }

    pub async fn status_author(&self, status_id: StatusId) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT author_id FROM statuses WHERE id = ?")
            .bind(status_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn add_status_view(&self, status_id: StatusId, user_id: UserId) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO status_views (status_id, user_id) VALUES (?, ?)")
                .bind(status_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn status_viewers(&self, status_id: StatusId) -> Result<Vec<UserId>> {
        let rows =
            sqlx::query("SELECT user_id FROM status_views WHERE status_id = ? ORDER BY user_id")
                .bind(status_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn delete_expired_statuses(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM statuses WHERE expires_at_ms <= ?")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn store_media(
        &self,
        uploader_id: UserId,
        chat_id: ChatId,
        bytes: &[u8],
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> Result<MediaId> {
        let rec = sqlx::query(
            "INSERT INTO media (uploader_id, chat_id, bytes, mime_type, filename, size_bytes, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(uploader_id.0)
        .bind(chat_id.0)
        .bind(bytes)
        .bind(mime_type)
        .bind(filename)
        .bind(i64::try_from(bytes.len()).unwrap_or(i64::MAX))
        .bind(to_millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(MediaId(rec.get::<i64, _>(0)))
    }

    pub async fn load_media(&self, media_id: MediaId) -> Result<Option<StoredMedia>> {
        let row = sqlx::query(
            "SELECT id, uploader_id, chat_id, bytes, mime_type, filename, size_bytes FROM media WHERE id = ?",
        )
        .bind(media_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredMedia {
            media_id: MediaId(r.get::<i64, _>(0)),
            uploader_id: UserId(r.get::<i64, _>(1)),
            chat_id: ChatId(r.get::<i64, _>(2)),
            bytes: r.get::<Vec<u8>, _>(3),
            mime_type: r.get::<Option<String>, _>(4),
            filename: r.get::<Option<String>, _>(5),
            size_bytes: r.get::<i64, _>(6).max(0) as u64,
        }))
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let message_id = MessageId(r.get::<i64, _>(0));
    let body: MessageBody = serde_json::from_str(&r.get::<String, _>(4))
        .with_context(|| format!("corrupt body for message {}", message_id.0))?;
    let reply_to = r
        .get::<Option<String>, _>(5)
        .map(|raw| serde_json::from_str::<ReplyPreview>(&raw))
        .transpose()
        .with_context(|| format!("corrupt reply snapshot for message {}", message_id.0))?;
    Ok(StoredMessage {
        message_id,
        chat_id: ChatId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<Option<String>, _>(3),
        body,
        reply_to,
        sent_at: from_millis(r.get::<i64, _>(6)),
        reactions: BTreeMap::new(),
        read_by: BTreeSet::new(),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
