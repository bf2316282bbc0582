use super::*;
use crate::test_support::{direct_chat_between, setup};
use shared::{domain::ReceiptMark, error::ErrorCode};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn sent_message_appears_once_after_earlier_messages() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;

    let first = send_message(&env.ctx, env.alice, chat_id, MessageBody::text("one"), None)
        .await
        .expect("first");
    let second = send_message(&env.ctx, env.bob, chat_id, MessageBody::text("two"), None)
        .await
        .expect("second");

    let log = list_messages(&env.ctx, env.alice, chat_id, None)
        .await
        .expect("list");
    let ids: Vec<_> = log.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first.message_id, second.message_id]);
    assert!(log[1].sent_at > log[0].sent_at);
    assert_eq!(second.receipt(), ReceiptMark::Sent);
}

#[tokio::test]
async fn send_fires_one_trigger_and_updates_chat_preview() {
    let mut env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    let message = send_message(&env.ctx, env.alice, chat_id, MessageBody::text("ping"), None)
        .await
        .expect("send");

    let trigger = env.triggers.try_recv().expect("trigger");
    assert_eq!(
        trigger,
        MessageCreated {
            chat_id,
            message_id: message.message_id,
            sender_id: env.alice,
        }
    );
    assert!(env.triggers.try_recv().is_err());

    let chat = crate::get_chat(&env.ctx, env.bob, chat_id)
        .await
        .expect("chat");
    let latest = chat.latest_message.expect("latest");
    assert_eq!(latest.preview, "ping");
    assert_eq!(latest.sent_at, message.sent_at);
}

#[tokio::test]
async fn non_participants_and_empty_bodies_are_rejected() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;

    let err = send_message(&env.ctx, env.carol, chat_id, MessageBody::text("hi"), None)
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    let err = send_message(&env.ctx, env.alice, chat_id, MessageBody::text("   "), None)
        .await
        .expect_err("blank");
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    let log = list_messages(&env.ctx, env.alice, chat_id, None)
        .await
        .expect("list");
    assert!(log.is_empty());
}

#[tokio::test]
async fn reply_carries_a_snapshot_of_the_original() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    let original = send_message(
        &env.ctx,
        env.alice,
        chat_id,
        MessageBody::Image {
            url: "/media/1".into(),
            caption: None,
        },
        None,
    )
    .await
    .expect("original");

    let reply = send_message(
        &env.ctx,
        env.bob,
        chat_id,
        MessageBody::text("nice"),
        Some(original.message_id),
    )
    .await
    .expect("reply");
    let snapshot = reply.reply_to.expect("snapshot");
    assert_eq!(snapshot.message_id, original.message_id);
    assert_eq!(snapshot.sender_name.as_deref(), Some("Alice"));
    assert_eq!(snapshot.preview, "Image");

    let other_chat = direct_chat_between(&env.ctx, env.alice, env.carol).await;
    let err = send_message(
        &env.ctx,
        env.alice,
        other_chat,
        MessageBody::text("cross-chat reply"),
        Some(original.message_id),
    )
    .await
    .expect_err("reply across chats");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn reactions_are_idempotent_sets() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    let message = send_message(&env.ctx, env.alice, chat_id, MessageBody::text("hi"), None)
        .await
        .expect("send");

    add_reaction(&env.ctx, env.bob, chat_id, message.message_id, "❤️")
        .await
        .expect("add");
    let twice = add_reaction(&env.ctx, env.bob, chat_id, message.message_id, "❤️")
        .await
        .expect("add again");
    assert_eq!(twice.reaction_count("❤️"), 1);
    assert!(twice.has_reacted(env.bob, "❤️"));

    let removed = remove_reaction(&env.ctx, env.bob, chat_id, message.message_id, "❤️")
        .await
        .expect("remove");
    assert_eq!(removed.reaction_count("❤️"), 0);

    let log = list_messages(&env.ctx, env.alice, chat_id, None)
        .await
        .expect("list");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message_id, message.message_id);
}

#[tokio::test]
async fn reaction_on_message_from_other_chat_is_not_found() {
    let env = setup().await;
    let chat_a = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    let chat_b = direct_chat_between(&env.ctx, env.alice, env.carol).await;
    let message = send_message(&env.ctx, env.alice, chat_a, MessageBody::text("hi"), None)
        .await
        .expect("send");

    let err = add_reaction(&env.ctx, env.alice, chat_b, message.message_id, "👍")
        .await
        .expect_err("wrong chat");
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = add_reaction(&env.ctx, env.alice, chat_a, message.message_id, " ")
        .await
        .expect_err("blank emoji");
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn mark_read_flips_receipt_and_counts_new_reads() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    for text in ["a", "b", "c"] {
        send_message(&env.ctx, env.alice, chat_id, MessageBody::text(text), None)
            .await
            .expect("send");
    }

    assert_eq!(mark_read(&env.ctx, env.bob, chat_id, None).await.expect("read"), 3);
    assert_eq!(mark_read(&env.ctx, env.bob, chat_id, None).await.expect("again"), 0);

    let log = list_messages(&env.ctx, env.alice, chat_id, None)
        .await
        .expect("list");
    assert!(log.iter().all(|m| m.receipt() == ReceiptMark::Read));
}

#[tokio::test]
async fn message_subscription_delivers_snapshot_after_reaction() {
    let env = setup().await;
    let chat_id = direct_chat_between(&env.ctx, env.alice, env.bob).await;
    let message = send_message(&env.ctx, env.alice, chat_id, MessageBody::text("hi"), None)
        .await
        .expect("send");

    let mut sub = subscribe_messages(&env.ctx, env.bob, chat_id)
        .await
        .expect("subscribe");
    let initial = timeout(Duration::from_secs(2), sub.next_snapshot())
        .await
        .expect("initial")
        .expect("open")
        .expect("snapshot");
    assert_eq!(initial.len(), 1);

    add_reaction(&env.ctx, env.bob, chat_id, message.message_id, "👍")
        .await
        .expect("react");
    let updated = timeout(Duration::from_secs(2), sub.next_snapshot())
        .await
        .expect("update")
        .expect("open")
        .expect("snapshot");
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].reaction_count("👍"), 1);

    let err = subscribe_messages(&env.ctx, env.carol, chat_id)
        .await
        .err()
        .expect("outsider");
    assert_eq!(err.code, ErrorCode::PermissionDenied);
}
