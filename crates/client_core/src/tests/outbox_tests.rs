use super::*;
use crate::test_support::{confirmed, memory_feed, Call, ScriptedRemote, BASE_MS};
use storage::LocalMessageStore;

async fn outbox() -> (Arc<ScriptedRemote>, Arc<FeedState>, Outbox) {
    let (_storage, feed) = memory_feed().await;
    let remote = ScriptedRemote::new();
    let outbox = Outbox::new(remote.clone(), feed.clone());
    (remote, feed, outbox)
}

#[tokio::test]
async fn failed_send_stays_visible_and_resend_confirms_it() {
    let (remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");
    remote.push_create(Err(FeedError::Transport("offline".into())));

    let err = outbox
        .compose(&channel, &UserId::new("alice"), "hello", Vec::new(), None)
        .await
        .expect_err("offline");
    assert!(matches!(err, FeedError::Transport(_)));

    let snapshot = feed.snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.posts.len(), 1);
    let failed = snapshot.posts[0].clone();
    assert!(failed.key.is_pending());
    assert_eq!(failed.status, PostStatus::Failed);
    let token = failed.pending_token.clone().expect("token");

    let sent = outbox.resend(&channel, &token).await.expect("resend");
    assert_eq!(sent.status, PostStatus::Sent);
    assert_eq!(sent.key, PostKey::Confirmed(PostId::new("srv-1")));

    let snapshot = feed.snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.posts.len(), 1, "pending copy replaced, not duplicated");
    assert_eq!(snapshot.posts[0].key, sent.key);
    assert_eq!(snapshot.posts[0].body, "hello");
    assert_eq!(feed.resolved(&channel, &token).await, Some(PostId::new("srv-1")));

    let drafts: Vec<PostDraft> = remote
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Create(draft) => Some(draft),
            _ => None,
        })
        .collect();
    assert_eq!(drafts.len(), 2);
    assert_eq!(drafts[0], drafts[1], "resend reuses body and token");
}

#[tokio::test]
async fn successful_compose_leaves_one_confirmed_post() {
    let (_remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");

    let sent = outbox
        .compose(&channel, &UserId::new("alice"), "hi", Vec::new(), None)
        .await
        .expect("send");
    let snapshot = feed.snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.posts.len(), 1);
    assert_eq!(snapshot.posts[0].key, sent.key);
    assert!(feed
        .store()
        .post(&PostKey::Pending(sent.pending_token.clone().expect("token")))
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn edit_merges_server_copy() {
    let (remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");
    let post = confirmed("p1", "c1", "alice", BASE_MS);
    feed.merge(&channel, vec![post], MergeDirection::First)
        .await
        .expect("seed");

    let updated = outbox
        .edit(&channel, &PostId::new("p1"), "fixed typo")
        .await
        .expect("edit");
    assert_eq!(updated.body, "fixed typo");
    assert_eq!(
        remote.calls(),
        vec![Call::Update(PostId::new("p1"), "fixed typo".into())]
    );
    let snapshot = feed.snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.posts[0].body, "fixed typo");

    let missing = outbox
        .edit(&channel, &PostId::new("ghost"), "x")
        .await
        .expect_err("unknown");
    assert!(matches!(missing, FeedError::UnknownPost(_)));
}

#[tokio::test]
async fn delete_removes_post_and_keeps_tombstone() {
    let (remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");
    feed.merge(
        &channel,
        vec![
            confirmed("p1", "c1", "alice", BASE_MS),
            confirmed("p2", "c1", "bob", BASE_MS + 1),
        ],
        MergeDirection::First,
    )
    .await
    .expect("seed");

    outbox
        .delete(&channel, &PostId::new("p1"))
        .await
        .expect("delete");

    assert!(remote.calls().contains(&Call::Delete(PostId::new("p1"))));
    let snapshot = feed.snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.posts.len(), 1);
    assert_eq!(snapshot.sections[0].len(), 1);
    let tombstone = feed
        .store()
        .post(&PostKey::Confirmed(PostId::new("p1")))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(tombstone.status, PostStatus::Deleted);
    assert!(tombstone.deleted_at.is_some());
}

#[tokio::test]
async fn search_hits_are_sorted_and_not_merged() {
    let (remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");
    remote.set_search_hits(vec![
        confirmed("late", "c1", "bob", BASE_MS + 10),
        confirmed("early", "c1", "alice", BASE_MS),
    ]);

    let hits = outbox.search("needle", &channel).await.expect("search");
    assert_eq!(hits[0].key, PostKey::Confirmed(PostId::new("early")));
    assert_eq!(hits.len(), 2);
    assert!(feed.snapshot(&channel).await.expect("snapshot").posts.is_empty());
}

#[tokio::test]
async fn mark_viewed_updates_server_and_store() {
    let (remote, feed, outbox) = outbox().await;
    let channel = ChannelId::new("c1");

    outbox.mark_viewed(&channel).await.expect("viewed");

    assert_eq!(remote.calls(), vec![Call::Viewed(channel.clone())]);
    let stored = feed
        .store()
        .channel(&channel)
        .await
        .expect("channel")
        .expect("row");
    assert!(stored.last_viewed_at.is_some());
}
