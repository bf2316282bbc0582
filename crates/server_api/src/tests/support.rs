use shared::domain::{ChatId, UserId};
use storage::Storage;
use tokio::sync::mpsc;

use crate::{notifications::MessageCreated, ApiConfig, ApiContext};

pub(crate) struct TestEnv {
    pub ctx: ApiContext,
    pub triggers: mpsc::UnboundedReceiver<MessageCreated>,
    pub alice: UserId,
    pub bob: UserId,
    pub carol: UserId,
}

pub(crate) async fn setup() -> TestEnv {
    setup_with(ApiConfig::default()).await
}

pub(crate) async fn setup_with(config: ApiConfig) -> TestEnv {
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
    let (ctx, triggers) = ApiContext::new(storage, config);
    TestEnv {
        ctx,
        triggers,
        alice,
        bob,
        carol,
    }
}

pub(crate) async fn direct_chat_between(ctx: &ApiContext, a: UserId, b: UserId) -> ChatId {
    crate::create_chat(ctx, a, &[b], None, false)
        .await
        .expect("direct chat")
        .chat_id
}

pub(crate) async fn make_contacts(ctx: &ApiContext, a: UserId, b: UserId) {
    crate::send_contact_request(ctx, a, b)
        .await
        .expect("request");
    crate::accept_contact_request(ctx, b, a)
        .await
        .expect("accept");
}
