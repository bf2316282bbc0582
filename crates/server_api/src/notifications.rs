//! Push notification fan-out for new messages.
//!
//! The send path fires a [`MessageCreated`] trigger per stored message; a
//! [`NotificationWorker`] drains the queue and delivers one multicast push to
//! every device of every other participant. Delivery problems are logged and
//! never reach the sender.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{truncate_chars, ChatId, MessageBody, MessageId, UserId};
use storage::{Storage, StoredChat, StoredMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const PUSH_BODY_CHARS: usize = 100;
const FALLBACK_SENDER_NAME: &str = "Someone";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCreated {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: UserId,
}

#[derive(Clone)]
pub struct NotificationTrigger {
    tx: mpsc::UnboundedSender<MessageCreated>,
}

impl NotificationTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MessageCreated>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn fire(&self, event: MessageCreated) {
        if self.tx.send(event).is_err() {
            debug!(
                chat_id = event.chat_id.0,
                message_id = event.message_id.0,
                "no notification worker running; trigger dropped"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastMessage {
    pub tokens: Vec<String>,
    pub notification: PushNotification,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFailure {
    Unregistered,
    InvalidToken,
    Unavailable,
    Other(String),
}

impl TokenFailure {
    /// The token will never work again and should be forgotten.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TokenFailure::Unregistered | TokenFailure::InvalidToken)
    }

    fn from_code(code: &str) -> Self {
        match code {
            "unregistered" | "not_registered" => TokenFailure::Unregistered,
            "invalid_token" | "invalid_registration" | "invalid_argument" => {
                TokenFailure::InvalidToken
            }
            "unavailable" | "internal" => TokenFailure::Unavailable,
            other => TokenFailure::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResult {
    pub token: String,
    pub failure: Option<TokenFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MulticastReport {
    pub results: Vec<TokenResult>,
}

impl MulticastReport {
    pub fn all_delivered(tokens: &[String]) -> Self {
        Self {
            results: tokens
                .iter()
                .map(|token| TokenResult {
                    token: token.clone(),
                    failure: None,
                })
                .collect(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.failure.is_none()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_multicast(&self, message: &MulticastMessage) -> Result<MulticastReport>;
}

/// Used when no push endpoint is configured: every push is logged and
/// reported as delivered.
#[derive(Debug, Default, Clone)]
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn send_multicast(&self, message: &MulticastMessage) -> Result<MulticastReport> {
        info!(
            tokens = message.tokens.len(),
            title = %message.notification.title,
            body = %message.notification.body,
            "push multicast (log gateway)"
        );
        Ok(MulticastReport::all_delivered(&message.tokens))
    }
}

#[derive(Debug, Deserialize)]
struct HttpMulticastResponse {
    #[serde(default)]
    responses: Vec<HttpTokenResponse>,
}

#[derive(Debug, Deserialize)]
struct HttpTokenResponse {
    token: String,
    #[serde(default)]
    error: Option<String>,
}

/// Posts the multicast as JSON to a push provider endpoint. The provider
/// answers with one `{token, error?}` entry per token.
#[derive(Clone)]
pub struct HttpPushGateway {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushGateway {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_multicast(&self, message: &MulticastMessage) -> Result<MulticastReport> {
        let mut request = self.http.post(&self.endpoint).json(message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .context("push endpoint unreachable")?
            .error_for_status()
            .context("push endpoint rejected multicast")?;
        let parsed: HttpMulticastResponse = response
            .json()
            .await
            .context("invalid push endpoint response")?;

        let mut results: Vec<TokenResult> = parsed
            .responses
            .into_iter()
            .map(|r| TokenResult {
                token: r.token,
                failure: r.error.as_deref().map(TokenFailure::from_code),
            })
            .collect();
        // Tokens the provider did not mention are treated as delivered.
        for token in &message.tokens {
            if !results.iter().any(|r| &r.token == token) {
                results.push(TokenResult {
                    token: token.clone(),
                    failure: None,
                });
            }
        }
        Ok(MulticastReport { results })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// The chat or message is gone, or nobody but the sender is in the chat.
    NoRecipients,
    NoTokens,
    Dispatched {
        message: MulticastMessage,
        report: MulticastReport,
        pruned_tokens: usize,
    },
}

pub struct NotificationWorker {
    storage: Storage,
    gateway: Arc<dyn PushGateway>,
    prune_invalid_tokens: bool,
}

impl NotificationWorker {
    pub fn new(storage: Storage, gateway: Arc<dyn PushGateway>) -> Self {
        Self {
            storage,
            gateway,
            prune_invalid_tokens: true,
        }
    }

    pub fn with_token_pruning(mut self, enabled: bool) -> Self {
        self.prune_invalid_tokens = enabled;
        self
    }

    /// Processes triggers until every [`NotificationTrigger`] is dropped.
    pub async fn run(self, mut triggers: mpsc::UnboundedReceiver<MessageCreated>) {
        info!("notification worker started");
        while let Some(event) = triggers.recv().await {
            match self.fan_out(event).await {
                Ok(FanOutOutcome::Dispatched {
                    report,
                    pruned_tokens,
                    ..
                }) => info!(
                    chat_id = event.chat_id.0,
                    message_id = event.message_id.0,
                    delivered = report.success_count(),
                    failed = report.failure_count(),
                    pruned_tokens,
                    "push fan-out complete"
                ),
                Ok(outcome) => debug!(
                    chat_id = event.chat_id.0,
                    message_id = event.message_id.0,
                    ?outcome,
                    "push fan-out skipped"
                ),
                Err(err) => error!(
                    chat_id = event.chat_id.0,
                    message_id = event.message_id.0,
                    error = %format!("{err:#}"),
                    "push fan-out failed"
                ),
            }
        }
        info!("notification worker stopped");
    }

    pub async fn fan_out(&self, event: MessageCreated) -> Result<FanOutOutcome> {
        let Some(chat) = self.storage.load_chat(event.chat_id).await? else {
            return Ok(FanOutOutcome::NoRecipients);
        };
        let Some(message) = self.storage.load_message(event.message_id).await? else {
            return Ok(FanOutOutcome::NoRecipients);
        };

        let recipients: Vec<UserId> = chat
            .participants
            .iter()
            .copied()
            .filter(|user_id| *user_id != event.sender_id)
            .collect();
        if recipients.is_empty() {
            return Ok(FanOutOutcome::NoRecipients);
        }

        let owned = self.storage.device_tokens_for_users(&recipients).await?;
        let mut owners: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
        for (user_id, token) in owned {
            owners.entry(token).or_default().push(user_id);
        }
        if owners.is_empty() {
            debug!(chat_id = chat.chat_id.0, "no device tokens for recipients");
            return Ok(FanOutOutcome::NoTokens);
        }

        let sender_name = message
            .sender_name
            .clone()
            .unwrap_or_else(|| FALLBACK_SENDER_NAME.to_string());
        let tokens: Vec<String> = owners.keys().cloned().collect();
        let multicast = build_multicast(&chat, &sender_name, &message, tokens);
        let report = self.gateway.send_multicast(&multicast).await?;

        let mut pruned_tokens = 0;
        for result in &report.results {
            let Some(failure) = &result.failure else {
                continue;
            };
            warn!(token = %result.token, ?failure, "push delivery failed for token");
            if !self.prune_invalid_tokens || !failure.is_permanent() {
                continue;
            }
            for owner in owners.get(&result.token).into_iter().flatten() {
                match self.storage.remove_device_token(*owner, &result.token).await {
                    Ok(true) => pruned_tokens += 1,
                    Ok(false) => {}
                    Err(err) => warn!(user_id = owner.0, %err, "failed to prune device token"),
                }
            }
        }

        Ok(FanOutOutcome::Dispatched {
            message: multicast,
            report,
            pruned_tokens,
        })
    }
}

/// Title is the group name for group chats and the sender's name otherwise.
/// The body reads `"{sender}: {text}"`, cut to [`PUSH_BODY_CHARS`].
pub fn build_multicast(
    chat: &StoredChat,
    sender_name: &str,
    message: &StoredMessage,
    tokens: Vec<String>,
) -> MulticastMessage {
    let title = if chat.is_group_chat && !chat.chat_name.trim().is_empty() {
        chat.chat_name.clone()
    } else {
        sender_name.to_string()
    };
    let text = match &message.body {
        MessageBody::Text { content } => content.trim().to_string(),
        other => other.preview(),
    };
    let body = truncate_chars(&format!("{sender_name}: {text}"), PUSH_BODY_CHARS);

    let data = BTreeMap::from([
        ("chat_id".to_string(), message.chat_id.to_string()),
        ("sender_id".to_string(), message.sender_id.to_string()),
        ("message_id".to_string(), message.message_id.to_string()),
        ("type".to_string(), "message".to_string()),
    ]);

    MulticastMessage {
        tokens,
        notification: PushNotification { title, body },
        data,
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
