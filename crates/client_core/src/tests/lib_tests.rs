use super::*;
use crate::test_support::{confirmed, page, run_of_posts, ScriptedRemote, ScriptedUploads, BASE_MS};
use shared::{
    domain::{ChannelId, PendingToken, PostKey},
    protocol::{PostPayload, RealtimeEnvelope, RealtimeEvent},
};
use std::{
    env,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

async fn scripted_client(remote: Arc<ScriptedRemote>) -> FeedClient {
    let store = Storage::new("sqlite::memory:").await.expect("db");
    let settings = ClientSettings {
        page_size: 5,
        short_page_size: 2,
        ..ClientSettings::default()
    };
    FeedClient::from_parts(
        settings,
        UserId::new("me"),
        Arc::new(store),
        remote,
        ScriptedUploads::immediate(vec![0.5]),
    )
}

#[tokio::test]
async fn wired_client_pages_sends_and_applies_realtime_events() {
    let remote = ScriptedRemote::new();
    let client = scripted_client(remote.clone()).await;
    let channel = ChannelId::new("town");
    let mut updates = client.feed().subscribe(&channel).await.expect("subscribe");

    remote.push_page(Ok(page(run_of_posts("p", "town", BASE_MS, 5), 5)));
    let first = client
        .pagination()
        .load_first(&channel)
        .await
        .expect("first page");
    assert!(
        first.summary().expect("loaded").cursors.has_older,
        "configured page size drives last-page detection"
    );

    let sent = client
        .outbox()
        .compose(&channel, &UserId::new("me"), "hi all", Vec::new(), None)
        .await
        .expect("send");
    let token = sent.pending_token.clone().expect("token");

    // The realtime echo of our own post must not duplicate it.
    let echo = PostPayload::from_post(&sent).expect("confirmed");
    client.router().route(RealtimeEnvelope {
        channel_id: channel.clone(),
        event: RealtimeEvent::NewPost { post: echo },
    });
    let other = confirmed("rt-1", "town", "bob", BASE_MS + 3_600_000);
    client.router().route(RealtimeEnvelope {
        channel_id: channel.clone(),
        event: RealtimeEvent::NewPost {
            post: PostPayload::from_post(&other).expect("confirmed"),
        },
    });

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.post(&other.key).is_some()),
    )
    .await
    .expect("realtime merge in time")
    .expect("publisher alive")
    .clone();
    assert_eq!(snapshot.posts.len(), 7);
    assert!(snapshot.post(&PostKey::Pending(token.clone())).is_none());
    assert_eq!(
        client.feed().resolved(&channel, &token).await,
        sent.confirmed_id().cloned()
    );
}

#[tokio::test]
async fn wired_uploads_attach_to_composed_post() {
    let remote = ScriptedRemote::new();
    let client = scripted_client(remote).await;
    let channel = ChannelId::new("town");
    let token = PendingToken::new("local-1");
    let pending = shared::domain::Post::pending(
        token.clone(),
        channel.clone(),
        UserId::new("me"),
        "",
        Vec::new(),
        None,
        feed::now_millis(),
    );
    client
        .feed()
        .merge(&channel, vec![pending.clone()], MergeDirection::Local)
        .await
        .expect("pending");

    let state = client
        .uploads()
        .enqueue(AttachmentItem {
            item_id: "att-1".into(),
            channel_id: channel.clone(),
            owner: token,
            filename: "notes.txt".into(),
            mime_type: Some("text/plain".into()),
            bytes: b"remember the milk".to_vec(),
        })
        .expect("started")
        .await
        .expect("join");
    assert!(matches!(state, UploadState::Uploaded { .. }));

    let snapshot = client.feed().snapshot(&channel).await.expect("snapshot");
    assert_eq!(snapshot.post(&pending.key).expect("post").files.len(), 1);
}

#[tokio::test]
async fn connect_opens_store_at_configured_path() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("feed_client_connect_{suffix}"));
    let db_path = temp_root.join("nested").join("feed.db");
    let settings = ClientSettings {
        database_url: db_path.to_string_lossy().into_owned(),
        ..ClientSettings::default()
    };

    let client = FeedClient::connect(settings, UserId::new("me"))
        .await
        .expect("connect");
    assert!(db_path.exists());
    assert_eq!(client.settings().page_size, 60);
    drop(client);

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
