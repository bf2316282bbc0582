use super::*;
use chrono::Duration;

async fn store_with_pair() -> (Storage, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice@example.com", "Alice")
        .await
        .expect("alice");
    let bob = storage.create_user("+15550100", "Bob").await.expect("bob");
    (storage, alice, bob)
}

async fn direct_chat(storage: &Storage, a: UserId, b: UserId) -> ChatId {
    let (chat_id, _) = storage
        .create_chat(NewChat {
            participants: &[a, b],
            is_group_chat: false,
            chat_name: "",
            admins: &[],
            direct_key: Some(direct_chat_key(a, b)),
            created_at: Utc::now(),
        })
        .await
        .expect("chat");
    chat_id
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn registering_same_identity_returns_same_user() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage.create_user("dana@example.com", "Dana").await.expect("first");
    let second = storage
        .create_user("dana@example.com", "Someone Else")
        .await
        .expect("second");
    assert_eq!(first, second);
    assert_eq!(
        storage.display_name_for_user(first).await.expect("name"),
        Some("Dana".to_string())
    );
}

#[tokio::test]
async fn device_tokens_behave_as_a_set() {
    let (storage, alice, _) = store_with_pair().await;
    assert!(storage.add_device_token(alice, "tok-1").await.expect("add"));
    assert!(!storage.add_device_token(alice, "tok-1").await.expect("re-add"));
    assert!(storage.add_device_token(alice, "tok-2").await.expect("add"));
    assert_eq!(
        storage.list_device_tokens(alice).await.expect("list"),
        vec!["tok-1".to_string(), "tok-2".to_string()]
    );
    assert!(storage.remove_device_token(alice, "tok-1").await.expect("remove"));
    assert!(!storage.remove_device_token(alice, "tok-1").await.expect("remove again"));
}

#[tokio::test]
async fn direct_chat_insert_is_idempotent_for_either_order() {
    let (storage, alice, bob) = store_with_pair().await;
    let first = direct_chat(&storage, alice, bob).await;
    let (second, created) = storage
        .create_chat(NewChat {
            participants: &[bob, alice],
            is_group_chat: false,
            chat_name: "",
            admins: &[],
            direct_key: Some(direct_chat_key(bob, alice)),
            created_at: Utc::now(),
        })
        .await
        .expect("chat");
    assert_eq!(first, second);
    assert!(!created);
    assert_eq!(storage.list_chat_ids().await.expect("ids").len(), 1);
}

#[tokio::test]
async fn messages_list_in_send_order_with_limit_keeping_newest() {
    let (storage, alice, bob) = store_with_pair().await;
    let chat = direct_chat(&storage, alice, bob).await;
    let now = Utc::now();

    let first = storage
        .insert_message(chat, alice, &MessageBody::text("first"), None, now)
        .await
        .expect("first");
    // Same wall clock reading still yields a strictly later timestamp.
    let second = storage
        .insert_message(chat, bob, &MessageBody::text("second"), None, now)
        .await
        .expect("second");
    let third = storage
        .insert_message(chat, alice, &MessageBody::text("third"), None, now - Duration::seconds(5))
        .await
        .expect("third");
    assert!(second.sent_at > first.sent_at);
    assert!(third.sent_at > second.sent_at);

    let all = storage.list_chat_messages(chat, None).await.expect("all");
    let ids: Vec<_> = all.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first.message_id, second.message_id, third.message_id]);

    let newest_two = storage.list_chat_messages(chat, Some(2)).await.expect("two");
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].message_id, second.message_id);
    assert_eq!(newest_two[1].message_id, third.message_id);
}

#[tokio::test]
async fn sender_is_first_reader_and_reply_snapshot_persists() {
    let (storage, alice, bob) = store_with_pair().await;
    let chat = direct_chat(&storage, alice, bob).await;
    let original = storage
        .insert_message(chat, alice, &MessageBody::text("question?"), None, Utc::now())
        .await
        .expect("original");
    let reply_to = ReplyPreview {
        message_id: original.message_id,
        sender_id: alice,
        sender_name: Some("Alice".into()),
        kind: original.body.kind(),
        preview: original.body.preview(),
        sent_at: original.sent_at,
    };
    let reply = storage
        .insert_message(chat, bob, &MessageBody::text("answer"), Some(&reply_to), Utc::now())
        .await
        .expect("reply");

    let loaded = storage
        .load_message(reply.message_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(loaded.reply_to, Some(reply_to));
    assert_eq!(loaded.read_by, BTreeSet::from([bob]));
    assert_eq!(loaded.sender_name.as_deref(), Some("Bob"));
}

#[tokio::test]
async fn reactions_are_set_valued() {
    let (storage, alice, bob) = store_with_pair().await;
    let chat = direct_chat(&storage, alice, bob).await;
    let message = storage
        .insert_message(chat, alice, &MessageBody::text("hi"), None, Utc::now())
        .await
        .expect("message");

    assert!(storage.add_reaction(message.message_id, "👍", bob).await.expect("add"));
    assert!(!storage.add_reaction(message.message_id, "👍", bob).await.expect("add again"));
    let listed = storage.list_chat_messages(chat, None).await.expect("list");
    assert_eq!(listed[0].reactions.get("👍").map(BTreeSet::len), Some(1));

    assert!(storage.remove_reaction(message.message_id, "👍", bob).await.expect("remove"));
    let listed = storage.list_chat_messages(chat, None).await.expect("list");
    assert!(listed[0].reactions.is_empty());
}

#[tokio::test]
async fn mark_read_only_counts_new_reads_and_respects_upper_bound() {
    let (storage, alice, bob) = store_with_pair().await;
    let chat = direct_chat(&storage, alice, bob).await;
    let first = storage
        .insert_message(chat, alice, &MessageBody::text("one"), None, Utc::now())
        .await
        .expect("first");
    storage
        .insert_message(chat, alice, &MessageBody::text("two"), None, Utc::now())
        .await
        .expect("second");

    let marked = storage
        .mark_messages_read(chat, bob, Some(first.message_id), Utc::now())
        .await
        .expect("mark");
    assert_eq!(marked, 1);
    let marked = storage
        .mark_messages_read(chat, bob, None, Utc::now())
        .await
        .expect("mark rest");
    assert_eq!(marked, 1);
    let marked = storage
        .mark_messages_read(chat, bob, None, Utc::now())
        .await
        .expect("mark again");
    assert_eq!(marked, 0);
}

#[tokio::test]
async fn accept_contact_request_rolls_back_when_batch_fails() {
    let (storage, alice, bob) = store_with_pair().await;
    storage.add_pending_request(bob, alice).await.expect("pending");
    // Fails the last write, after the request row and one contact row are gone.
    let trigger = format!(
        "CREATE TRIGGER fail_second_contact BEFORE INSERT ON contacts
         WHEN NEW.user_id = {}
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        bob.0
    );
    sqlx::query(&trigger)
        .execute(storage.pool())
        .await
        .expect("trigger");

    storage
        .accept_contact_request(bob, alice)
        .await
        .expect_err("batch should fail");

    assert!(!storage.is_contact(alice, bob).await.expect("a->b"));
    assert!(!storage.is_contact(bob, alice).await.expect("b->a"));
    assert!(storage.has_pending_request(bob, alice).await.expect("pending"));
}

#[tokio::test]
async fn accept_without_a_pending_request_writes_nothing() {
    let (storage, alice, bob) = store_with_pair().await;
    let accepted = storage
        .accept_contact_request(bob, alice)
        .await
        .expect("accept");
    assert!(!accepted);
    assert!(!storage.is_contact(alice, bob).await.expect("a->b"));
    assert!(!storage.is_contact(bob, alice).await.expect("b->a"));

    storage.add_pending_request(bob, alice).await.expect("pending");
    assert!(storage.accept_contact_request(bob, alice).await.expect("accept"));
    assert!(storage.is_contact(alice, bob).await.expect("a->b"));
    assert!(!storage.has_pending_request(bob, alice).await.expect("cleared"));
}

#[tokio::test]
async fn status_feed_hides_expired_and_non_contact_posts() {
    let (storage, alice, bob) = store_with_pair().await;
    let carol = storage
        .create_user("carol@example.com", "Carol")
        .await
        .expect("carol");
    storage.add_pending_request(alice, bob).await.expect("pending");
    storage.accept_contact_request(alice, bob).await.expect("accept");

    let now = Utc::now();
    storage
        .insert_status(bob, "visible", None, now, now + Duration::hours(24))
        .await
        .expect("bob status");
    storage
        .insert_status(bob, "expired", None, now - Duration::hours(25), now - Duration::hours(1))
        .await
        .expect("expired status");
    storage
        .insert_status(carol, "stranger", None, now, now + Duration::hours(24))
        .await
        .expect("carol status");

    let feed = storage.list_status_feed(alice, now).await.expect("feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].content, "visible");

    let deleted = storage.delete_expired_statuses(now).await.expect("sweep");
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn stale_typing_rows_are_filtered_and_swept() {
    let (storage, alice, bob) = store_with_pair().await;
    let chat = direct_chat(&storage, alice, bob).await;
    let now = Utc::now();
    storage
        .upsert_typing(chat, alice, now - Duration::seconds(45))
        .await
        .expect("stale");
    storage.upsert_typing(chat, bob, now).await.expect("fresh");

    let fresh = storage
        .list_typing(chat, now - Duration::seconds(30))
        .await
        .expect("list");
    assert_eq!(fresh.iter().map(|(u, _)| *u).collect::<Vec<_>>(), vec![bob]);

    let removed = storage
        .delete_stale_typing(chat, now - Duration::seconds(30))
        .await
        .expect("sweep");
    assert_eq!(removed, 1);
}
