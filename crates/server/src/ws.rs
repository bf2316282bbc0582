//! `/ws`: each connection holds a set of live topic subscriptions and streams
//! their snapshots to the client as [`ServerEvent`]s.

use std::{pin::Pin, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, Stream, StreamExt};
use server_api::{
    subscribe_chats, subscribe_contacts, subscribe_messages, subscribe_statuses,
    subscribe_typing, ApiContext, Subscription,
};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{ClientRequest, ServerEvent, Topic},
};
use tokio::sync::mpsc;
use tokio_stream::StreamMap;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

const OUTBOUND_BUFFER: usize = 64;

type SnapshotStream = Pin<Box<dyn Stream<Item = ServerEvent> + Send>>;

pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(err) => {
                    warn!(%err, "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    info!(user_id = user_id.0, "websocket connected");
    let mut subscriptions: StreamMap<Topic, SnapshotStream> = StreamMap::new();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = handle_request(&state.api, user_id, &text, &mut subscriptions).await;
                if outbound.send(reply).await.is_err() {
                    break;
                }
            }
            Some((topic, event)) = subscriptions.next(), if !subscriptions.is_empty() => {
                debug!(user_id = user_id.0, ?topic, "pushing snapshot");
                if outbound.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        user_id = user_id.0,
        released = subscriptions.len(),
        "websocket closed"
    );
    drop(subscriptions);
    send_task.abort();
}

async fn handle_request(
    api: &ApiContext,
    user_id: UserId,
    text: &str,
    subscriptions: &mut StreamMap<Topic, SnapshotStream>,
) -> ServerEvent {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(err) => {
            return ServerEvent::Error(ApiError::invalid_argument(format!(
                "invalid request: {err}"
            )))
        }
    };

    match request {
        ClientRequest::Subscribe { topic } => {
            if subscriptions.contains_key(&topic) {
                return ServerEvent::Subscribed { topic };
            }
            match open_topic(api, user_id, topic).await {
                Ok(stream) => {
                    subscriptions.insert(topic, stream);
                    ServerEvent::Subscribed { topic }
                }
                Err(err) => ServerEvent::Error(err),
            }
        }
        ClientRequest::Unsubscribe { topic } => {
            subscriptions.remove(&topic);
            ServerEvent::Unsubscribed { topic }
        }
    }
}

/// Subscribes `user_id` to `topic`. Per-user topics only open for their owner.
pub(crate) async fn open_topic(
    api: &ApiContext,
    user_id: UserId,
    topic: Topic,
) -> Result<SnapshotStream, ApiError> {
    match topic {
        Topic::ChatMessages { chat_id } => {
            let sub = subscribe_messages(api, user_id, chat_id).await?;
            Ok(snapshots(sub, move |messages| ServerEvent::MessagesSnapshot {
                chat_id,
                messages,
            }))
        }
        Topic::ChatTyping { chat_id } => {
            let sub = subscribe_typing(api, chat_id, user_id).await?;
            Ok(snapshots(sub, move |users| ServerEvent::TypingSnapshot {
                chat_id,
                users,
            }))
        }
        Topic::UserChats { user_id: owner } => {
            ensure_owner(owner, user_id)?;
            let sub = subscribe_chats(api, owner).await?;
            Ok(snapshots(sub, move |chats| ServerEvent::ChatsSnapshot {
                user_id: owner,
                chats,
            }))
        }
        Topic::UserContacts { user_id: owner } => {
            ensure_owner(owner, user_id)?;
            let sub = subscribe_contacts(api, owner).await?;
            Ok(snapshots(sub, move |contacts| ServerEvent::ContactsSnapshot {
                user_id: owner,
                contacts,
            }))
        }
        Topic::Statuses => {
            let sub = subscribe_statuses(api, user_id).await?;
            Ok(snapshots(sub, |statuses| ServerEvent::StatusesSnapshot {
                statuses,
            }))
        }
    }
}

fn ensure_owner(owner: UserId, caller: UserId) -> Result<(), ApiError> {
    if owner != caller {
        return Err(ApiError::permission_denied(
            "cannot subscribe to another user's feed",
        ));
    }
    Ok(())
}

fn snapshots<T, F>(sub: Subscription<T>, to_event: F) -> SnapshotStream
where
    T: Send + 'static,
    F: Fn(T) -> ServerEvent + Send + 'static,
{
    Box::pin(sub.map(move |snapshot| match snapshot {
        Ok(value) => to_event(value),
        Err(err) => ServerEvent::Error(err),
    }))
}
