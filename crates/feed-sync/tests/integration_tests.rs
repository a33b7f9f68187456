/// Session-level reconciliation tests
/// Drive a `FeedSession` against an in-memory backend and feed broadcast
/// events through the same path the channel uses.
mod common;

use common::*;
use feed_sync::feed_model::{Counter, PostId, UserId, UserProfile};
use feed_sync::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn loaded(posts: Vec<feed_sync::feed_model::Post>) -> (Arc<MockGateway>, Arc<FeedSession>) {
    let gateway = Arc::new(MockGateway::with_posts(posts));
    let session = Arc::new(session(gateway.clone()));
    session.load_next_posts().await.unwrap();
    (gateway, session)
}

fn likes(session: &FeedSession, id: &str) -> u64 {
    session.post(&PostId::from(id)).unwrap().counts.likes.value()
}

fn liked(session: &FeedSession, id: &str) -> bool {
    session.post(&PostId::from(id)).unwrap().is_liked()
}

fn outstanding(session: &FeedSession) -> usize {
    session.read(|state| state.controller.outstanding_count())
}

fn like_frame(event: &str, user: &str, post: &str) -> BroadcastEvent {
    frame(event, json!({ "postId": post, "userId": user }))
}

#[tokio::test]
async fn test_like_confirmed_then_echoed() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;

    // Local actor likes the post
    let outcome = session.toggle_like(&PostId::from("p1")).await.unwrap();
    assert_eq!(outcome, Toggle::Confirmed(true));
    assert_eq!(likes(&session, "p1"), 6);
    assert!(liked(&session, "p1"));

    // Own echo arrives afterwards
    session.handle_event(&like_frame("like:created", "me", "p1"));
    assert_eq!(likes(&session, "p1"), 6);
    assert!(liked(&session, "p1"));
    assert_eq!(outstanding(&session), 0);
}

#[tokio::test]
async fn test_echo_before_confirmation() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;
    let gate = gateway.hold_next();

    let task = {
        let session = session.clone();
        tokio::spawn(async move { session.toggle_like(&PostId::from("p1")).await })
    };
    settle_until(|| gateway.calls("toggle_like") == 1).await;
    assert_eq!(likes(&session, "p1"), 6);

    // Broadcast overtakes the response
    session.handle_event(&like_frame("like:created", "me", "p1"));
    assert_eq!(likes(&session, "p1"), 6);

    gate.notify_one();
    assert_eq!(task.await.unwrap().unwrap(), Toggle::Confirmed(true));
    assert_eq!(likes(&session, "p1"), 6);
    assert!(liked(&session, "p1"));
    assert_eq!(outstanding(&session), 0);
}

#[tokio::test]
async fn test_failed_like_rolls_back() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;
    gateway.fail_next(500);

    let err = session.toggle_like(&PostId::from("p1")).await.unwrap_err();
    assert!(matches!(err, FeedError::ServerError { status: 500, .. }));
    assert_eq!(likes(&session, "p1"), 5);
    assert!(!liked(&session, "p1"));
    assert_eq!(outstanding(&session), 0);
}

#[tokio::test]
async fn test_failed_unlike_restores_exact_state() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 3)]).await;
    session.toggle_like(&PostId::from("p1")).await.unwrap();
    session.handle_event(&like_frame("like:created", "me", "p1"));
    let before = session.post(&PostId::from("p1")).unwrap();

    gateway.fail_next(503);
    assert!(session.toggle_like(&PostId::from("p1")).await.is_err());
    assert_eq!(session.post(&PostId::from("p1")).unwrap(), before);
}

#[tokio::test]
async fn test_foreign_like_leaves_local_flag() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;

    session.handle_event(&like_frame("like:created", "alice", "p1"));
    assert_eq!(likes(&session, "p1"), 6);
    assert!(!liked(&session, "p1"));
}

#[tokio::test]
async fn test_double_click_is_ignored() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;
    let gate = gateway.hold_next();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.toggle_like(&PostId::from("p1")).await })
    };
    settle_until(|| gateway.calls("toggle_like") == 1).await;

    // Second click lands while the first is in flight
    let second = session.toggle_like(&PostId::from("p1")).await.unwrap();
    assert_eq!(second, Toggle::Ignored);

    gate.notify_one();
    first.await.unwrap().unwrap();
    session.handle_event(&like_frame("like:created", "me", "p1"));

    assert_eq!(likes(&session, "p1"), 6);
    assert_eq!(gateway.calls("toggle_like"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_expires() {
    let session = session(Arc::new(MockGateway::default()));
    let post = PostId::from("p1");

    session.handle_event(&frame(
        "comment:typing",
        json!({ "postId": "p1", "displayName": "Xavier" }),
    ));
    assert_eq!(session.typing_labels(&post), vec!["Xavier"]);

    tokio::time::advance(Duration::from_millis(1999)).await;
    session.sweep();
    assert_eq!(session.typing_labels(&post), vec!["Xavier"]);

    tokio::time::advance(Duration::from_millis(1)).await;
    session.sweep();
    assert!(session.typing_labels(&post).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_renewal_and_stop() {
    let session = session(Arc::new(MockGateway::default()));
    let post = PostId::from("p1");
    let typing = frame(
        "comment:typing",
        json!({ "postId": "p1", "displayName": "Xavier" }),
    );

    session.handle_event(&typing);
    tokio::time::advance(Duration::from_millis(1500)).await;
    session.handle_event(&typing);
    tokio::time::advance(Duration::from_millis(1500)).await;
    session.sweep();
    assert_eq!(session.typing_labels(&post), vec!["Xavier"]);

    session.handle_event(&frame(
        "comment:stop-typing",
        json!({ "postId": "p1", "displayName": "Xavier" }),
    ));
    assert!(session.typing_labels(&post).is_empty());

    // Our own label coming back from the server is not shown
    session.handle_event(&frame(
        "comment:typing",
        json!({ "postId": "p1", "displayName": "Me" }),
    ));
    assert!(session.typing_labels(&post).is_empty());
}

#[tokio::test]
async fn test_unlike_echo_nets_minus_one() {
    let mut post = post_with_likes("p1", 5);
    post.liked = Some(true);
    let (gateway, session) = loaded(vec![post]).await;
    gateway.backend.lock().liked.insert(PostId::from("p1"));

    let outcome = session.toggle_like(&PostId::from("p1")).await.unwrap();
    assert_eq!(outcome, Toggle::Confirmed(false));
    session.handle_event(&like_frame("like:removed", "me", "p1"));

    assert_eq!(likes(&session, "p1"), 4);
    assert!(!liked(&session, "p1"));
}

#[tokio::test]
async fn test_duplicate_foreign_event_applies_once() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;
    let event = BroadcastEvent::decode(
        &json!({
            "event": "like:created",
            "id": "evt-42",
            "data": { "postId": "p1", "userId": "alice" }
        })
        .to_string(),
    )
    .unwrap();

    session.handle_event(&event);
    let once = session.post(&PostId::from("p1")).unwrap();
    session.handle_event(&event);
    assert_eq!(session.post(&PostId::from("p1")).unwrap(), once);
    assert_eq!(once.counts.likes.value(), 6);
}

#[tokio::test]
async fn test_counters_never_go_negative() {
    let mut post = post_with_likes("p1", 0);
    post.liked = Some(true);
    let (gateway, session) = loaded(vec![post]).await;
    let p1 = PostId::from("p1");

    // Stale local flag: an unlike on a zero counter stays at zero
    gateway.fail_next(500);
    assert!(session.toggle_like(&p1).await.is_err());
    assert_eq!(likes(&session, "p1"), 0);

    session.handle_event(&like_frame("like:removed", "alice", "p1"));
    session.handle_event(&like_frame("like:removed", "bob", "p1"));
    assert_eq!(likes(&session, "p1"), 0);

    gateway.fail_next(500);
    session.handle_event(&like_frame("like:created", "carol", "p1"));
    assert_eq!(likes(&session, "p1"), 1);
    assert!(session.toggle_like(&p1).await.is_err());
    assert_eq!(likes(&session, "p1"), 1);
}

#[tokio::test]
async fn test_pagination_stops_on_short_page() {
    let posts = (0..12).map(|i| post_with_likes(&format!("p{i}"), 0)).collect();
    let gateway = Arc::new(MockGateway::with_posts(posts));
    let session = session(gateway.clone());

    let first = session.load_next_posts().await.unwrap();
    assert_eq!(first.inserted, 10);
    assert!(first.has_more);

    let second = session.load_next_posts().await.unwrap();
    assert_eq!(second.inserted, 2);
    assert!(!second.has_more);

    let third = session.load_next_posts().await.unwrap();
    assert_eq!(third.inserted, 0);
    assert_eq!(gateway.calls("list_posts"), 2);
    assert_eq!(session.posts().len(), 12);
}

#[tokio::test]
async fn test_liked_state_loaded_with_posts() {
    let gateway = Arc::new(MockGateway::with_posts(vec![
        post_with_likes("p1", 1),
        post_with_likes("p2", 0),
    ]));
    gateway.backend.lock().liked.insert(PostId::from("p1"));
    gateway.backend.lock().broken_checks.insert(PostId::from("p2"));
    let session = session(gateway.clone());

    session.load_next_posts().await.unwrap();
    assert!(liked(&session, "p1"));
    assert!(!liked(&session, "p2"));
    assert_eq!(
        session.post(&PostId::from("p2")).unwrap().liked,
        Some(false)
    );
}

#[tokio::test]
async fn test_view_recorded_once_per_device() {
    let gateway = Arc::new(MockGateway::with_posts(vec![post_with_likes("p1", 0)]));
    let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let session = session_with(gateway.clone(), storage.clone());
    session.load_next_posts().await.unwrap();
    let p1 = PostId::from("p1");

    assert!(session.record_view(&p1).await.unwrap());
    assert_eq!(session.post(&p1).unwrap().counts.views.value(), 1);
    session.handle_event(&frame("view:created", json!({ "postId": "p1", "userId": "me" })));
    assert_eq!(session.post(&p1).unwrap().counts.views.value(), 1);

    assert!(!session.record_view(&p1).await.unwrap());
    assert_eq!(gateway.calls("create_view"), 1);
    assert_eq!(gateway.calls("check_viewed"), 1);

    // A reload on the same device remembers the view without asking
    let reloaded = session_with(gateway.clone(), storage);
    assert!(!reloaded.record_view(&p1).await.unwrap());
    assert_eq!(gateway.calls("check_viewed"), 1);
}

#[tokio::test]
async fn test_view_already_known_to_server() {
    let gateway = Arc::new(MockGateway::with_posts(vec![post_with_likes("p1", 0)]));
    gateway.backend.lock().viewed.insert(PostId::from("p1"));
    let session = session(gateway.clone());
    session.load_next_posts().await.unwrap();

    assert!(!session.record_view(&PostId::from("p1")).await.unwrap());
    assert_eq!(gateway.calls("create_view"), 0);
    assert_eq!(
        session.post(&PostId::from("p1")).unwrap().counts.views.value(),
        0
    );
}

#[tokio::test]
async fn test_comment_applied_once() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 0)]).await;
    let p1 = PostId::from("p1");
    session.load_comments(&p1).await.unwrap();

    let comment = session
        .create_comment(&p1, "  first!  ")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(comment.content, "first!");
    assert_eq!(session.comments(&p1).len(), 1);

    session.handle_event(&frame(
        "comment:created",
        json!({ "id": comment.id, "postId": "p1", "userId": "me", "content": "first!" }),
    ));
    assert_eq!(session.comments(&p1).len(), 1);
    assert_eq!(session.post(&p1).unwrap().counts.comments.value(), 1);

    // Someone else comments
    session.handle_event(&frame(
        "comment:created",
        json!({ "id": "c-alice", "postId": "p1", "userId": "alice", "content": "hi" }),
    ));
    assert_eq!(session.comments(&p1).len(), 2);
    assert_eq!(session.post(&p1).unwrap().counts.comments.value(), 2);

    session.handle_event(&frame(
        "comment:deleted",
        json!({ "commentId": "c-alice", "postId": "p1" }),
    ));
    session.handle_event(&frame(
        "comment:deleted",
        json!({ "commentId": "c-alice", "postId": "p1" }),
    ));
    assert_eq!(session.post(&p1).unwrap().counts.comments.value(), 1);
}

#[tokio::test]
async fn test_blank_comment_never_reaches_gateway() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 0)]).await;

    let err = session
        .create_comment(&PostId::from("p1"), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::ValidationError(_)));
    assert_eq!(gateway.calls("create_comment"), 0);
    assert_eq!(
        session.post(&PostId::from("p1")).unwrap().counts.comments.value(),
        0
    );
}

#[tokio::test]
async fn test_own_comment_delete_counts_once() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 0)]).await;
    let p1 = PostId::from("p1");
    session.load_comments(&p1).await.unwrap();
    let comment = session.create_comment(&p1, "oops").await.unwrap().unwrap();
    session.handle_event(&frame(
        "comment:created",
        json!({ "id": comment.id, "postId": "p1", "userId": "me", "content": "oops" }),
    ));

    session.delete_comment(&comment.id).await.unwrap();
    session.handle_event(&frame(
        "comment:deleted",
        json!({ "commentId": comment.id, "postId": "p1", "userId": "me" }),
    ));
    assert!(session.comments(&p1).is_empty());
    assert_eq!(session.post(&p1).unwrap().counts.comments.value(), 0);
}

#[tokio::test]
async fn test_refresh_resolves_missing_echo() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;

    session.toggle_like(&PostId::from("p1")).await.unwrap();
    assert_eq!(outstanding(&session), 1);

    // The echo never arrives; a manual refresh sees the server count
    session.refresh().await.unwrap();
    assert_eq!(likes(&session, "p1"), 6);
    assert!(liked(&session, "p1"));
    assert_eq!(outstanding(&session), 0);

    // A very late echo is absorbed
    session.handle_event(&like_frame("like:created", "me", "p1"));
    assert_eq!(likes(&session, "p1"), 6);
    assert_eq!(gateway.calls("list_posts"), 2);
}

#[tokio::test]
async fn test_overlapping_page_resolves_confirmed_like() {
    let posts = (0..11)
        .map(|i| post_with_likes(&format!("p{i}"), if i == 9 { 5 } else { 0 }))
        .collect();
    let gateway = Arc::new(MockGateway::with_posts(posts));
    let session = session(gateway.clone());
    session.load_next_posts().await.unwrap();

    session.toggle_like(&PostId::from("p9")).await.unwrap();
    assert_eq!(likes(&session, "p9"), 6);

    // A new post at the head shifts the server list; the next page repeats
    // p9 with a count that already includes our like.
    gateway
        .backend
        .lock()
        .posts
        .insert(0, post_with_likes("fresh", 0));
    let page = session.load_next_posts().await.unwrap();
    assert_eq!(page.inserted, 1);
    assert_eq!(likes(&session, "p9"), 6);
    assert_eq!(outstanding(&session), 0);

    session.handle_event(&like_frame("like:created", "me", "p9"));
    assert_eq!(likes(&session, "p9"), 6);
    assert!(liked(&session, "p9"));
}

#[tokio::test]
async fn test_live_post_during_page_fetch_keeps_page() {
    let posts = (0..10).map(|i| post_with_likes(&format!("p{i}"), 0)).collect();
    let gateway = Arc::new(MockGateway::with_posts(posts));
    let session = Arc::new(session(gateway.clone()));
    let gate = gateway.hold_next();

    let task = {
        let session = session.clone();
        tokio::spawn(async move { session.load_next_posts().await })
    };
    settle_until(|| gateway.calls("list_posts") == 1).await;

    let live = json!({ "id": "live", "content": "hot off the press" });
    session.handle_event(&frame("post:created", live));
    gate.notify_one();

    let page = task.await.unwrap().unwrap();
    assert_eq!(page.inserted, 10);
    assert_eq!(session.posts().len(), 11);
    assert_eq!(page.next_cursor.offset, 11);
}

#[tokio::test]
async fn test_post_lifecycle_from_broadcasts() {
    let (_gateway, session) = loaded(vec![post_with_likes("p1", 0)]).await;

    session.handle_event(&frame(
        "post:created",
        json!({ "id": "p2", "userId": "alice", "content": "hello" }),
    ));
    session.handle_event(&frame(
        "post:created",
        json!({ "id": "p2", "userId": "alice", "content": "hello" }),
    ));
    assert_eq!(session.posts().len(), 2);
    assert_eq!(session.posts()[0].id, PostId::from("p2"));

    session.handle_event(&frame(
        "post:updated",
        json!({ "id": "p2", "userId": "alice", "content": "hello, edited" }),
    ));
    assert_eq!(session.post(&PostId::from("p2")).unwrap().content, "hello, edited");

    session.handle_event(&frame("post:deleted", json!({ "postId": "p2" })));
    assert!(session.post(&PostId::from("p2")).is_none());
}

#[tokio::test]
async fn test_created_post_not_duplicated_by_echo() {
    let (_gateway, session) = loaded(Vec::new()).await;

    let post = session
        .create_post(&PostDraft::new("brand new"))
        .await
        .unwrap();
    session.handle_event(&frame(
        "post:created",
        json!({ "id": post.id, "userId": "me", "content": "brand new" }),
    ));
    assert_eq!(session.posts().len(), 1);

    session.delete_post(&post.id).await.unwrap();
    session.handle_event(&frame("post:deleted", json!({ "postId": post.id })));
    assert!(session.posts().is_empty());
}

#[tokio::test]
async fn test_follow_and_follower_counts() {
    let gateway = Arc::new(MockGateway::default());
    let mut bob = UserProfile::new(UserId::from("bob"));
    bob.counts.followers = Counter::new(2);
    gateway.backend.lock().users = vec![bob, UserProfile::new(UserId::from("me"))];
    let session = session(gateway.clone());

    session.load_users().await.unwrap();
    assert_eq!(session.user(&UserId::from("bob")).unwrap().following, Some(false));
    // No self check
    assert_eq!(gateway.calls("check_following"), 1);

    let outcome = session.toggle_follow(&UserId::from("bob")).await.unwrap();
    assert_eq!(outcome, Toggle::Confirmed(true));
    session.handle_event(&frame(
        "follower:created",
        json!({ "followerId": "me", "followedId": "bob" }),
    ));

    let bob = session.user(&UserId::from("bob")).unwrap();
    assert!(bob.is_followed());
    assert_eq!(bob.counts.followers.value(), 3);
    assert_eq!(
        session.user(&UserId::from("me")).unwrap().counts.following.value(),
        1
    );

    // Foreign unfollow of bob by someone else
    session.handle_event(&frame(
        "follow:removed",
        json!({ "followerId": "zed", "followedId": "bob" }),
    ));
    let bob = session.user(&UserId::from("bob")).unwrap();
    assert_eq!(bob.counts.followers.value(), 2);
    assert!(bob.is_followed());
}

#[tokio::test]
async fn test_notifications_accumulate() {
    let session = session(Arc::new(MockGateway::default()));
    let notification = frame(
        "notification",
        json!({ "id": "n1", "type": "NEW_FOLLOW", "data": { "followerId": "alice" } }),
    );

    session.handle_event(&notification);
    session.handle_event(&notification);
    session.handle_event(&frame(
        "notification",
        json!({ "type": "NEW_LIKE", "data": { "id": "n2" } }),
    ));

    assert_eq!(session.unread_count(), 2);
    session.clear_notifications();
    assert!(session.notifications().is_empty());
}

#[tokio::test]
async fn test_late_confirmation_after_end_is_harmless() {
    let (gateway, session) = loaded(vec![post_with_likes("p1", 5)]).await;
    let gate = gateway.hold_next();

    let task = {
        let session = session.clone();
        tokio::spawn(async move { session.toggle_like(&PostId::from("p1")).await })
    };
    settle_until(|| gateway.calls("toggle_like") == 1).await;

    session.end();
    gate.notify_one();
    assert_eq!(task.await.unwrap().unwrap(), Toggle::Confirmed(true));
    assert_eq!(outstanding(&session), 0);
}
