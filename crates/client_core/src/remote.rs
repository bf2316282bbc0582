//! Talks to a running server: REST for commands, one websocket per live
//! subscription.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ChatId, MessageBody, MessageId, UserId},
    error::ApiError,
    protocol::{
        ChatSummary, ClientRequest, ContactRequestBody, CreateChatRequest, CreateChatResponse,
        MarkReadRequest, MarkReadResponse, MessagePayload, ReactionRequest, SendMessageRequest,
        ServerEvent, SetTypingRequest, Topic, TypingUser,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::{
    backend::{ChatBackend, SnapshotStream},
    error::BackendError,
};

#[derive(Clone)]
pub struct RemoteBackend {
    http: Client,
    base: Url,
}

impl RemoteBackend {
    pub fn new(server_url: &str) -> Result<Self, BackendError> {
        let base = Url::parse(server_url).map_err(|err| {
            BackendError::Api(ApiError::invalid_argument(format!(
                "invalid server url '{server_url}': {err}"
            )))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(BackendError::Api(ApiError::invalid_argument(
                "server_url must start with http:// or https://",
            )));
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base.join(path).map_err(|err| {
            BackendError::Api(ApiError::invalid_argument(format!("invalid path '{path}': {err}")))
        })
    }

    fn ws_url(&self, user_id: UserId) -> Result<Url, BackendError> {
        let mut url = self.endpoint("/ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| {
            BackendError::Api(ApiError::invalid_argument("cannot derive websocket url"))
        })?;
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.0.to_string());
        Ok(url)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, BackendError> {
        Ok(self.http.request(method, self.endpoint(path)?))
    }

    async fn send_json<B, R>(&self, method: Method, path: &str, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = execute(self.request(method, path)?.json(body)).await?;
        Ok(response.json::<R>().await?)
    }

    async fn send_empty<B>(&self, method: Method, path: &str, body: &B) -> Result<(), BackendError>
    where
        B: Serialize + ?Sized,
    {
        execute(self.request(method, path)?.json(body)).await?;
        Ok(())
    }

    async fn subscribe<T, F>(
        &self,
        user_id: UserId,
        topic: Topic,
        extract: F,
    ) -> Result<SnapshotStream<T>, BackendError>
    where
        T: Send + 'static,
        F: Fn(ServerEvent) -> Option<T> + Send + 'static,
    {
        let url = self.ws_url(user_id)?;
        let (mut socket, _) = connect_async(url.as_str()).await?;
        let request = serde_json::to_string(&ClientRequest::Subscribe { topic })
            .map_err(|err| BackendError::Api(ApiError::internal(err.to_string())))?;
        socket.send(Message::Text(request)).await?;
        debug!(?topic, "subscribed over websocket");

        let stream = socket.filter_map(move |frame| {
            let item = match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(ServerEvent::Error(err)) => Some(Err(BackendError::Api(err))),
                    Ok(event) => extract(event).map(Ok),
                    Err(err) => {
                        warn!(%err, "ignoring invalid server event");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(BackendError::from(err))),
            };
            future::ready(item)
        });
        Ok(Box::pin(stream))
    }
}

/// Sends `request`, turning non-success statuses into the server's
/// [`ApiError`] when the body carries one.
async fn execute(request: RequestBuilder) -> Result<Response, BackendError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(BackendError::Api(err)),
        Err(_) => Err(BackendError::Network(format!("server returned {status}: {body}"))),
    }
}

#[async_trait]
impl ChatBackend for RemoteBackend {
    async fn subscribe_chats(
        &self,
        user_id: UserId,
    ) -> Result<SnapshotStream<Vec<ChatSummary>>, BackendError> {
        self.subscribe(user_id, Topic::UserChats { user_id }, |event| match event {
            ServerEvent::ChatsSnapshot { chats, .. } => Some(chats),
            _ => None,
        })
        .await
    }

    async fn subscribe_messages(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<MessagePayload>>, BackendError> {
        self.subscribe(user_id, Topic::ChatMessages { chat_id }, |event| match event {
            ServerEvent::MessagesSnapshot { messages, .. } => Some(messages),
            _ => None,
        })
        .await
    }

    async fn subscribe_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<SnapshotStream<Vec<TypingUser>>, BackendError> {
        self.subscribe(user_id, Topic::ChatTyping { chat_id }, |event| match event {
            ServerEvent::TypingSnapshot { users, .. } => Some(users),
            _ => None,
        })
        .await
    }

    async fn send_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        body: MessageBody,
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, BackendError> {
        let request = SendMessageRequest {
            user_id,
            body,
            reply_to,
        };
        self.send_json(Method::POST, &format!("/chats/{chat_id}/messages"), &request)
            .await
    }

    async fn add_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        let request = ReactionRequest {
            user_id,
            emoji: emoji.to_string(),
        };
        self.send_json(
            Method::POST,
            &format!("/chats/{chat_id}/messages/{message_id}/reactions"),
            &request,
        )
        .await
    }

    async fn remove_reaction(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<MessagePayload, BackendError> {
        let request = ReactionRequest {
            user_id,
            emoji: emoji.to_string(),
        };
        self.send_json(
            Method::DELETE,
            &format!("/chats/{chat_id}/messages/{message_id}/reactions"),
            &request,
        )
        .await
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        up_to: Option<MessageId>,
    ) -> Result<u64, BackendError> {
        let request = MarkReadRequest { user_id, up_to };
        let response: MarkReadResponse = self
            .send_json(Method::POST, &format!("/chats/{chat_id}/read"), &request)
            .await?;
        Ok(response.marked)
    }

    async fn set_typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        is_typing: bool,
    ) -> Result<(), BackendError> {
        let request = SetTypingRequest { user_id, is_typing };
        self.send_empty(Method::POST, &format!("/chats/{chat_id}/typing"), &request)
            .await
    }

    async fn create_chat(
        &self,
        user_id: UserId,
        participants: &[UserId],
        chat_name: Option<&str>,
        is_group_chat: bool,
    ) -> Result<CreateChatResponse, BackendError> {
        let request = CreateChatRequest {
            user_id,
            participants: participants.to_vec(),
            chat_name: chat_name.map(str::to_string),
            is_group_chat,
        };
        self.send_json(Method::POST, "/chats", &request).await
    }

    async fn send_contact_request(
        &self,
        user_id: UserId,
        target: UserId,
    ) -> Result<(), BackendError> {
        let request = ContactRequestBody {
            user_id,
            other_user_id: target,
        };
        self.send_empty(Method::POST, "/contacts/requests", &request)
            .await
    }

    async fn accept_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError> {
        let request = ContactRequestBody {
            user_id,
            other_user_id: requester,
        };
        self.send_empty(Method::POST, "/contacts/requests/accept", &request)
            .await
    }

    async fn reject_contact_request(
        &self,
        user_id: UserId,
        requester: UserId,
    ) -> Result<(), BackendError> {
        let request = ContactRequestBody {
            user_id,
            other_user_id: requester,
        };
        self.send_empty(Method::POST, "/contacts/requests/reject", &request)
            .await
    }
}
