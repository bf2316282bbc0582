use super::*;
use axum::{body, body::Body, http::Request, response::Response};
use server_api::ApiConfig;
use shared::{
    domain::MessageBody,
    protocol::{ServerEvent, Topic},
};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    api: ApiContext,
    alice: i64,
    bob: i64,
    carol: i64,
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice@example.com", "Alice")
        .await
        .expect("alice");
    let bob = storage.create_user("+15550100", "Bob").await.expect("bob");
    let carol = storage
        .create_user("carol@example.com", "Carol")
        .await
        .expect("carol");

    let (api, _triggers) = ApiContext::new(storage, ApiConfig::default());
    let app = build_router(Arc::new(AppState { api: api.clone() }));
    TestApp {
        app,
        api,
        alice: alice.0,
        bob: bob.0,
        carol: carol.0,
    }
}

fn json_request(method: &str, uri: impl AsRef<str>, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri.as_ref())
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_request(uri: impl AsRef<str>) -> Request<Body> {
    Request::get(uri.as_ref())
        .body(Body::empty())
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn create_direct_chat(t: &TestApp) -> i64 {
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/chats",
            serde_json::json!({ "user_id": t.alice, "participants": [t.bob] }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let created: CreateChatResponse = read_json(response).await;
    created.chat_id.0
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let response = t.app.oneshot(get_request("/healthz")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn register_is_find_or_create_by_identity() {
    let t = test_app().await;
    let request = || {
        json_request(
            "POST",
            "/users",
            serde_json::json!({ "identity": "dana@example.com", "display_name": "Dana" }),
        )
    };
    let first: UserProfile = read_json(t.app.clone().oneshot(request()).await.expect("first")).await;
    let second: UserProfile = read_json(t.app.clone().oneshot(request()).await.expect("second")).await;
    assert_eq!(first.user_id, second.user_id);

    let response = t
        .app
        .oneshot(get_request(format!("/users/{}", first.user_id)))
        .await
        .expect("profile");
    assert_eq!(response.status(), StatusCode::OK);
    let profile: UserProfile = read_json(response).await;
    assert_eq!(profile.display_name, "Dana");
}

#[tokio::test]
async fn direct_chat_route_is_idempotent() {
    let t = test_app().await;
    let first = create_direct_chat(&t).await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/chats",
            serde_json::json!({ "user_id": t.bob, "participants": [t.alice] }),
        ))
        .await
        .expect("response");
    let again: CreateChatResponse = read_json(response).await;
    assert_eq!(again.chat_id.0, first);
    assert!(again.exists);

    let response = t
        .app
        .oneshot(get_request(format!("/chats?user_id={}", t.bob)))
        .await
        .expect("list");
    let chats: Vec<ChatSummary> = read_json(response).await;
    assert_eq!(chats.len(), 1);
}

#[tokio::test]
async fn send_list_react_and_read_messages() {
    let t = test_app().await;
    let chat_id = create_direct_chat(&t).await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            format!("/chats/{chat_id}/messages"),
            serde_json::json!({
                "user_id": t.alice,
                "body": { "type": "text", "content": "hello" },
            }),
        ))
        .await
        .expect("send");
    assert_eq!(response.status(), StatusCode::OK);
    let sent: MessagePayload = read_json(response).await;
    assert_eq!(sent.body, MessageBody::text("hello"));

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            format!("/chats/{chat_id}/messages/{}/reactions", sent.message_id),
            serde_json::json!({ "user_id": t.bob, "emoji": "👍" }),
        ))
        .await
        .expect("react");
    let reacted: MessagePayload = read_json(response).await;
    assert_eq!(reacted.reaction_count("👍"), 1);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "DELETE",
            format!("/chats/{chat_id}/messages/{}/reactions", sent.message_id),
            serde_json::json!({ "user_id": t.bob, "emoji": "👍" }),
        ))
        .await
        .expect("unreact");
    let unreacted: MessagePayload = read_json(response).await;
    assert_eq!(unreacted.reaction_count("👍"), 0);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            format!("/chats/{chat_id}/read"),
            serde_json::json!({ "user_id": t.bob }),
        ))
        .await
        .expect("read");
    let marked: MarkReadResponse = read_json(response).await;
    assert_eq!(marked.marked, 1);

    let response = t
        .app
        .oneshot(get_request(format!(
            "/chats/{chat_id}/messages?user_id={}&limit=10",
            t.bob
        )))
        .await
        .expect("list");
    let messages: Vec<MessagePayload> = read_json(response).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].read_by.len(), 2);
}

#[tokio::test]
async fn error_codes_map_to_http_statuses() {
    let t = test_app().await;
    let chat_id = create_direct_chat(&t).await;

    let outsider_send = json_request(
        "POST",
        format!("/chats/{chat_id}/messages"),
        serde_json::json!({
            "user_id": t.carol,
            "body": { "type": "text", "content": "let me in" },
        }),
    );
    let response = t.app.clone().oneshot(outsider_send).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/chats/9999/messages?user_id=1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/chats?user_id=9999"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = || {
        json_request(
            "POST",
            "/contacts/requests",
            serde_json::json!({ "user_id": t.alice, "other_user_id": t.bob }),
        )
    };
    let response = t.app.clone().oneshot(request()).await.expect("first");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = t.app.oneshot(request()).await.expect("second");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn contact_accept_then_status_feed() {
    let t = test_app().await;
    for (uri, user, other) in [
        ("/contacts/requests", t.alice, t.bob),
        ("/contacts/requests/accept", t.bob, t.alice),
    ] {
        let response = t
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                uri,
                serde_json::json!({ "user_id": user, "other_user_id": other }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/statuses",
            serde_json::json!({ "user_id": t.bob, "content": "new haircut" }),
        ))
        .await
        .expect("post status");
    let created: CreateStatusResponse = read_json(response).await;

    let response = t
        .app
        .clone()
        .oneshot(get_request(format!("/statuses/feed?user_id={}", t.alice)))
        .await
        .expect("feed");
    let feed: Vec<StatusPayload> = read_json(response).await;
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].status_id, created.status_id);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            format!("/statuses/{}/views", created.status_id),
            serde_json::json!({ "user_id": t.alice }),
        ))
        .await
        .expect("view");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = t
        .app
        .oneshot(
            Request::post("/maintenance/statuses/sweep")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("sweep");
    let report: SweepReport = read_json(response).await;
    assert_eq!(report.deleted_count, 0);
}

#[tokio::test]
async fn typing_routes_set_and_read() {
    let t = test_app().await;
    let chat_id = create_direct_chat(&t).await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            format!("/chats/{chat_id}/typing"),
            serde_json::json!({ "user_id": t.alice, "is_typing": true }),
        ))
        .await
        .expect("set typing");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = t
        .app
        .oneshot(get_request(format!(
            "/chats/{chat_id}/typing?user_id={}",
            t.bob
        )))
        .await
        .expect("typing");
    let users: Vec<TypingUser> = read_json(response).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id.0, t.alice);
}

#[tokio::test]
async fn media_upload_and_download_requires_participation() {
    let t = test_app().await;
    let chat_id = create_direct_chat(&t).await;

    let upload = Request::post(format!(
        "/media?user_id={}&chat_id={chat_id}&filename=photo.jpg&mime_type=image/jpeg",
        t.alice
    ))
    .body(Body::from("jpeg-bytes"))
    .expect("request");
    let response = t.app.clone().oneshot(upload).await.expect("upload");
    assert_eq!(response.status(), StatusCode::OK);
    let media: MediaRef = read_json(response).await;

    let response = t
        .app
        .clone()
        .oneshot(get_request(format!("{}?user_id={}", media.url, t.bob)))
        .await
        .expect("download");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "image/jpeg"
    );
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"jpeg-bytes");

    let response = t
        .app
        .oneshot(get_request(format!("{}?user_id={}", media.url, t.carol)))
        .await
        .expect("outsider");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn websocket_topics_only_open_for_members_and_owners() {
    let t = test_app().await;
    let chat_id = ChatId(create_direct_chat(&t).await);
    let alice = UserId(t.alice);

    let stream = ws::open_topic(&t.api, alice, Topic::ChatMessages { chat_id }).await;
    assert!(stream.is_ok());
    let err = ws::open_topic(&t.api, UserId(t.carol), Topic::ChatMessages { chat_id })
        .await
        .err()
        .expect("outsider");
    assert_eq!(err.code, ErrorCode::PermissionDenied);
    let err = ws::open_topic(&t.api, alice, Topic::UserChats { user_id: UserId(t.bob) })
        .await
        .err()
        .expect("other user's chat list");
    assert_eq!(err.code, ErrorCode::PermissionDenied);
}

#[tokio::test]
async fn websocket_topic_stream_emits_snapshot_events() {
    use futures::StreamExt;

    let t = test_app().await;
    let chat_id = ChatId(create_direct_chat(&t).await);
    let mut stream = ws::open_topic(&t.api, UserId(t.bob), Topic::ChatMessages { chat_id })
        .await
        .expect("stream");

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("first")
        .expect("event");
    assert!(matches!(first, ServerEvent::MessagesSnapshot { ref messages, .. } if messages.is_empty()));

    server_api::send_message(&t.api, UserId(t.alice), chat_id, MessageBody::text("hi"), None)
        .await
        .expect("send");
    let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("next")
        .expect("event");
    match next {
        ServerEvent::MessagesSnapshot { messages, .. } => assert_eq!(messages.len(), 1),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn every_error_code_has_a_status() {
    assert_eq!(status_for(ErrorCode::PermissionDenied), StatusCode::FORBIDDEN);
    assert_eq!(status_for(ErrorCode::AlreadyExists), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(status_for(ErrorCode::InvalidArgument), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(ErrorCode::Unauthenticated), StatusCode::UNAUTHORIZED);
    assert_eq!(status_for(ErrorCode::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(status_for(ErrorCode::NetworkFailure), StatusCode::BAD_GATEWAY);
}
