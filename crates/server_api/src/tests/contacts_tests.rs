use super::*;
use crate::test_support::setup;
use shared::error::ErrorCode;

#[tokio::test]
async fn request_accept_makes_mutual_contacts() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");
    assert_eq!(
        contact_state(&env.ctx, env.alice, env.bob).await.expect("state"),
        ContactState::Pending
    );
    assert_eq!(
        list_contacts(&env.ctx, env.bob).await.expect("bob").pending_requests,
        vec![env.alice]
    );

    accept_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect("accept");

    let alice = list_contacts(&env.ctx, env.alice).await.expect("alice");
    let bob = list_contacts(&env.ctx, env.bob).await.expect("bob");
    assert_eq!(alice.contacts, vec![env.bob]);
    assert_eq!(bob.contacts, vec![env.alice]);
    assert!(bob.pending_requests.is_empty());
    assert_eq!(
        contact_state(&env.ctx, env.bob, env.alice).await.expect("state"),
        ContactState::Mutual
    );
}

#[tokio::test]
async fn duplicate_and_self_requests_are_rejected() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("first");
    let err = send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect_err("second");
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    let err = send_contact_request(&env.ctx, env.alice, env.alice)
        .await
        .expect_err("self");
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    let err = send_contact_request(&env.ctx, env.alice, UserId(9_999))
        .await
        .expect_err("missing target");
    assert_eq!(err.code, ErrorCode::NotFound);

    accept_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect("accept");
    let err = send_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect_err("already mutual");
    assert_eq!(err.code, ErrorCode::AlreadyExists);
}

#[tokio::test]
async fn accept_without_request_is_not_found() {
    let env = setup().await;
    let err = accept_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect_err("nothing pending");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn accept_after_reject_does_not_make_contacts() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");
    reject_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect("reject");

    let err = accept_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect_err("request is gone");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert!(list_contacts(&env.ctx, env.alice)
        .await
        .expect("alice")
        .contacts
        .is_empty());
    assert!(list_contacts(&env.ctx, env.bob)
        .await
        .expect("bob")
        .contacts
        .is_empty());
}

#[tokio::test]
async fn racing_accept_and_reject_leave_a_consistent_pair() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");

    let (accepted, rejected) = tokio::join!(
        accept_contact_request(&env.ctx, env.bob, env.alice),
        reject_contact_request(&env.ctx, env.bob, env.alice),
    );
    rejected.expect("reject never fails");

    let alice = list_contacts(&env.ctx, env.alice).await.expect("alice");
    let bob = list_contacts(&env.ctx, env.bob).await.expect("bob");
    assert!(bob.pending_requests.is_empty());
    match accepted {
        Ok(()) => {
            assert_eq!(alice.contacts.len(), 1);
            assert_eq!(bob.contacts.len(), 1);
        }
        Err(err) => {
            assert_eq!(err.code, ErrorCode::NotFound);
            assert!(alice.contacts.is_empty());
            assert!(bob.contacts.is_empty());
        }
    }
}

#[tokio::test]
async fn reject_is_silent_and_idempotent() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");
    reject_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect("reject");
    reject_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect("reject again");

    assert_eq!(
        list_contacts(&env.ctx, env.bob).await.expect("bob"),
        ContactsSummary::default()
    );
    assert_eq!(
        contact_state(&env.ctx, env.alice, env.bob).await.expect("state"),
        ContactState::None
    );
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("can ask again after rejection");
}

#[tokio::test]
async fn failed_accept_applies_nothing() {
    let env = setup().await;
    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");
    sqlx::query(
        "CREATE TRIGGER fail_contact_insert BEFORE INSERT ON contacts
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
    )
    .execute(env.ctx.storage.pool())
    .await
    .expect("trigger");

    let err = accept_contact_request(&env.ctx, env.bob, env.alice)
        .await
        .expect_err("batch fails");
    assert_eq!(err.code, ErrorCode::Internal);

    let alice = list_contacts(&env.ctx, env.alice).await.expect("alice");
    let bob = list_contacts(&env.ctx, env.bob).await.expect("bob");
    assert!(alice.contacts.is_empty());
    assert!(bob.contacts.is_empty());
    assert_eq!(bob.pending_requests, vec![env.alice]);
}

#[tokio::test]
async fn contacts_subscription_sees_incoming_request() {
    use std::time::Duration;
    use tokio::time::timeout;

    let env = setup().await;
    let mut sub = subscribe_contacts(&env.ctx, env.bob).await.expect("subscribe");
    let wait = Duration::from_secs(2);
    let initial = timeout(wait, sub.next_snapshot())
        .await
        .expect("initial")
        .expect("open")
        .expect("snapshot");
    assert_eq!(initial, ContactsSummary::default());

    send_contact_request(&env.ctx, env.alice, env.bob)
        .await
        .expect("request");
    let updated = timeout(wait, sub.next_snapshot())
        .await
        .expect("update")
        .expect("open")
        .expect("snapshot");
    assert_eq!(updated.pending_requests, vec![env.alice]);
}
