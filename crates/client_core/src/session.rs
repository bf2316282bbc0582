use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use shared::{
    domain::{ChatId, MessageBody, MessageId, UserId},
    protocol::{ChatSummary, CreateChatResponse, MessagePayload, TypingUser},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ChatBackend, SnapshotStream},
    error::BackendError,
    notice::{Notice, NoticeBoard},
};

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);
pub const DEFAULT_NOTICE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long after the last keystroke the session reports "stopped typing".
    pub typing_idle: Duration,
    pub notice_ttl: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_idle: DEFAULT_TYPING_IDLE,
            notice_ttl: DEFAULT_NOTICE_TTL,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ChatsUpdated(Vec<ChatSummary>),
    MessagesUpdated {
        chat_id: ChatId,
        messages: Vec<MessagePayload>,
    },
    TypingUpdated {
        chat_id: ChatId,
        users: Vec<TypingUser>,
    },
    Notice(Notice),
}

/// A message shown locally while its send is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: Uuid,
    pub chat_id: ChatId,
    pub body: MessageBody,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

struct ActiveChat {
    chat_id: ChatId,
    messages_pump: JoinHandle<()>,
    typing_pump: JoinHandle<()>,
    newest_seen: watch::Receiver<Option<MessageId>>,
}

impl ActiveChat {
    /// Stops both pumps and waits until their subscriptions are dropped.
    async fn release(self) {
        self.messages_pump.abort();
        self.typing_pump.abort();
        let _ = self.messages_pump.await;
        let _ = self.typing_pump.await;
        debug!(chat_id = self.chat_id.0, "released chat subscriptions");
    }
}

#[derive(Default)]
struct SessionState {
    chat_list: Option<JoinHandle<()>>,
    active: Option<ActiveChat>,
    typing_timer: Option<JoinHandle<()>>,
    pending: Vec<PendingMessage>,
}

/// One signed-in user's view of the chat system. Owns every live
/// subscription it opens and releases them on switch, close and shutdown.
pub struct ChatSession {
    user_id: UserId,
    backend: Arc<dyn ChatBackend>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    notices: Arc<NoticeBoard>,
    state: Mutex<SessionState>,
}

impl ChatSession {
    pub fn new(user_id: UserId, backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_config(user_id, backend, SessionConfig::default())
    }

    pub fn with_config(user_id: UserId, backend: Arc<dyn ChatBackend>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let notices = NoticeBoard::new(config.notice_ttl, events.clone());
        Self {
            user_id,
            backend,
            config,
            events,
            notices,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn active_chat(&self) -> Option<ChatId> {
        self.state.lock().await.active.as_ref().map(|chat| chat.chat_id)
    }

    pub async fn pending_messages(&self) -> Vec<PendingMessage> {
        self.state.lock().await.pending.clone()
    }

    pub async fn notices(&self) -> Vec<Notice> {
        self.notices.active().await
    }

    pub async fn dismiss_notice(&self, id: u64) -> bool {
        self.notices.dismiss(id).await
    }

    /// Keeps the user's chat list live. Replaces any earlier chat list
    /// subscription.
    pub async fn load_chats(&self) -> Result<(), BackendError> {
        let stream = self
            .report(self.backend.subscribe_chats(self.user_id).await)
            .await?;
        let pump = self.spawn_pump(stream, SessionEvent::ChatsUpdated);
        let previous = self.state.lock().await.chat_list.replace(pump);
        if let Some(previous) = previous {
            previous.abort();
            let _ = previous.await;
        }
        Ok(())
    }

    /// Makes `chat_id` the open chat. The new subscriptions are live before
    /// the previous chat's are released.
    pub async fn open_chat(&self, chat_id: ChatId) -> Result<(), BackendError> {
        let messages = self
            .report(self.backend.subscribe_messages(self.user_id, chat_id).await)
            .await?;
        let typing = self
            .report(self.backend.subscribe_typing(self.user_id, chat_id).await)
            .await?;

        let (newest_tx, newest_seen) = watch::channel(None);
        let messages_pump = self.spawn_pump(messages, move |messages: Vec<MessagePayload>| {
            newest_tx.send_replace(messages.last().map(|m| m.message_id));
            SessionEvent::MessagesUpdated { chat_id, messages }
        });
        let typing_pump = self.spawn_pump(typing, move |users| SessionEvent::TypingUpdated {
            chat_id,
            users,
        });
        let next = ActiveChat {
            chat_id,
            messages_pump,
            typing_pump,
            newest_seen,
        };

        let (previous, timer) = {
            let mut state = self.state.lock().await;
            (state.active.replace(next), state.typing_timer.take())
        };
        if let Some(previous) = previous {
            self.stop_pending_typing(timer, previous.chat_id).await;
            previous.release().await;
        } else if let Some(timer) = timer {
            timer.abort();
        }
        info!(user_id = self.user_id.0, chat_id = chat_id.0, "chat opened");
        Ok(())
    }

    pub async fn close_chat(&self) {
        let (previous, timer) = {
            let mut state = self.state.lock().await;
            (state.active.take(), state.typing_timer.take())
        };
        if let Some(previous) = previous {
            self.stop_pending_typing(timer, previous.chat_id).await;
            previous.release().await;
        } else if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Cancels an armed idle timer for a chat being left and sends the stop
    /// it would have sent. An expired timer has already sent it.
    async fn stop_pending_typing(&self, timer: Option<JoinHandle<()>>, chat_id: ChatId) {
        let Some(timer) = timer else {
            return;
        };
        if timer.is_finished() {
            return;
        }
        timer.abort();
        if let Err(err) = self.backend.set_typing(self.user_id, chat_id, false).await {
            warn!(chat_id = chat_id.0, %err, "failed to clear typing for the chat being left");
        }
    }

    /// Releases every subscription and timer the session owns.
    pub async fn shutdown(&self) {
        self.close_chat().await;
        let chat_list = self.state.lock().await.chat_list.take();
        if let Some(chat_list) = chat_list {
            chat_list.abort();
            let _ = chat_list.await;
        }
        info!(user_id = self.user_id.0, "session shut down");
    }

    /// Sends to the open chat. A pending entry is visible until the server
    /// answers; the message snapshot takes over from there.
    pub async fn send_message(
        &self,
        body: MessageBody,
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, BackendError> {
        let chat_id = self.require_open_chat().await?;
        let local_id = Uuid::new_v4();
        self.state.lock().await.pending.push(PendingMessage {
            local_id,
            chat_id,
            body: body.clone(),
            reply_to,
            created_at: Utc::now(),
        });

        let result = self
            .backend
            .send_message(self.user_id, chat_id, body, reply_to)
            .await;
        self.state
            .lock()
            .await
            .pending
            .retain(|pending| pending.local_id != local_id);
        if let Err(err) = &result {
            warn!(chat_id = chat_id.0, %local_id, %err, "send failed");
        }
        self.report(result).await
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        let chat_id = self.require_open_chat().await?;
        let result = self
            .backend
            .add_reaction(self.user_id, chat_id, message_id, emoji)
            .await;
        self.report(result).await
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        let chat_id = self.require_open_chat().await?;
        let result = self
            .backend
            .remove_reaction(self.user_id, chat_id, message_id, emoji)
            .await;
        self.report(result).await
    }

    /// Adds the reaction unless this user already reacted with `emoji`, in
    /// which case it is removed.
    pub async fn toggle_reaction(
        &self,
        message: &MessagePayload,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        if message.has_reacted(self.user_id, emoji) {
            self.remove_reaction(message.message_id, emoji).await
        } else {
            self.add_reaction(message.message_id, emoji).await
        }
    }

    /// Marks the open chat read up to the newest message the session has seen.
    pub async fn mark_read(&self) -> Result<u64, BackendError> {
        let active = {
            let state = self.state.lock().await;
            state
                .active
                .as_ref()
                .map(|chat| (chat.chat_id, *chat.newest_seen.borrow()))
        };
        let Some((chat_id, newest)) = active else {
            return self.report(Err(BackendError::no_open_chat())).await;
        };
        let Some(newest) = newest else {
            return Ok(0);
        };
        let result = self
            .backend
            .mark_read(self.user_id, chat_id, Some(newest))
            .await;
        self.report(result).await
    }

    /// Reports typing state for the open chat. While typing, a stop is sent
    /// automatically once no keystroke arrives within the idle window.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), BackendError> {
        let chat_id = self.require_open_chat().await?;
        if let Some(timer) = self.state.lock().await.typing_timer.take() {
            timer.abort();
        }

        let result = self
            .backend
            .set_typing(self.user_id, chat_id, is_typing)
            .await;
        self.report(result).await?;

        if is_typing {
            let backend = Arc::clone(&self.backend);
            let notices = Arc::clone(&self.notices);
            let user_id = self.user_id;
            let idle = self.config.typing_idle;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                debug!(chat_id = chat_id.0, "typing idle, sending stop");
                if let Err(err) = backend.set_typing(user_id, chat_id, false).await {
                    notices.raise(&err).await;
                }
            });
            let mut state = self.state.lock().await;
            if let Some(stale) = state.typing_timer.replace(timer) {
                stale.abort();
            }
        }
        Ok(())
    }

    /// Finds or creates a direct chat, or creates a group chat.
    pub async fn create_chat(
        &self,
        participants: &[UserId],
        chat_name: Option<&str>,
        is_group_chat: bool,
    ) -> Result<CreateChatResponse, BackendError> {
        let result = self
            .backend
            .create_chat(self.user_id, participants, chat_name, is_group_chat)
            .await;
        self.report(result).await
    }

    pub async fn send_contact_request(&self, target: UserId) -> Result<(), BackendError> {
        let result = self.backend.send_contact_request(self.user_id, target).await;
        self.report(result).await
    }

    pub async fn accept_contact_request(&self, requester: UserId) -> Result<(), BackendError> {
        let result = self
            .backend
            .accept_contact_request(self.user_id, requester)
            .await;
        self.report(result).await
    }

    pub async fn reject_contact_request(&self, requester: UserId) -> Result<(), BackendError> {
        let result = self
            .backend
            .reject_contact_request(self.user_id, requester)
            .await;
        self.report(result).await
    }

    async fn require_open_chat(&self) -> Result<ChatId, BackendError> {
        let active = self.active_chat().await;
        match active {
            Some(chat_id) => Ok(chat_id),
            None => self.report(Err(BackendError::no_open_chat())).await,
        }
    }

    /// Surfaces a failure as a notice and hands the result back unchanged.
    async fn report<T>(&self, result: Result<T, BackendError>) -> Result<T, BackendError> {
        if let Err(err) = &result {
            self.notices.raise(err).await;
        }
        result
    }

    fn spawn_pump<T, F>(&self, stream: SnapshotStream<T>, to_event: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: Fn(T) -> SessionEvent + Send + 'static,
    {
        let events = self.events.clone();
        let notices = Arc::clone(&self.notices);
        tokio::spawn(pump(stream, events, notices, to_event))
    }
}

async fn pump<T, F>(
    mut stream: impl Stream<Item = Result<T, BackendError>> + Unpin,
    events: broadcast::Sender<SessionEvent>,
    notices: Arc<NoticeBoard>,
    to_event: F,
) where
    F: Fn(T) -> SessionEvent,
{
    while let Some(snapshot) = stream.next().await {
        match snapshot {
            Ok(value) => {
                // Nobody listening is fine.
                let _ = events.send(to_event(value));
            }
            Err(err) => {
                notices.raise(&err).await;
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(chat_list) = state.chat_list.take() {
            chat_list.abort();
        }
        if let Some(active) = state.active.take() {
            active.messages_pump.abort();
            active.typing_pump.abort();
        }
        if let Some(timer) = state.typing_timer.take() {
            timer.abort();
        }
    }
}
