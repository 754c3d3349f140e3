use super::*;
use shared::domain::{FileTransferState, PostKind, PostStatus};

fn post(id: &str, channel: &str, created_ms: i64) -> Post {
    Post {
        key: PostKey::Confirmed(PostId::new(id)),
        pending_token: None,
        channel_id: ChannelId::new(channel),
        author_id: UserId::new("alice"),
        root_id: None,
        created_at: millis_to_datetime(created_ms),
        updated_at: millis_to_datetime(created_ms),
        deleted_at: None,
        body: format!("post {id}"),
        status: PostStatus::Sent,
        files: Vec::new(),
        kind: PostKind::Common,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("feed_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("feed.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn lists_live_posts_in_feed_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut tombstone = post("gone", "c1", 1_500);
    tombstone.status = PostStatus::Deleted;
    tombstone.deleted_at = Some(millis_to_datetime(3_000));

    let mut pending = post("ignored", "c1", 2_000);
    pending.key = PostKey::Pending(PendingToken::new("tok"));
    pending.pending_token = Some(PendingToken::new("tok"));
    pending.status = PostStatus::Pending;

    storage
        .apply_batch(&PostBatch {
            upserts: vec![
                post("b", "c1", 2_000),
                post("a", "c1", 1_000),
                tombstone,
                pending.clone(),
                post("other", "c2", 1_000),
            ],
            removals: Vec::new(),
        })
        .await
        .expect("batch");

    let posts = storage
        .posts_in_channel(&ChannelId::new("c1"))
        .await
        .expect("posts");
    let keys: Vec<_> = posts.iter().map(|p| p.key.clone()).collect();
    assert_eq!(
        keys,
        vec![
            PostKey::Confirmed(PostId::new("a")),
            pending.key.clone(),
            PostKey::Confirmed(PostId::new("b")),
        ]
    );

    let loaded = storage.post(&pending.key).await.expect("lookup").expect("row");
    assert_eq!(loaded, pending);
}

#[tokio::test]
async fn batch_removals_and_upserts_apply_together() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let token = PendingToken::new("t-1");
    let mut pending = post("unused", "c1", 1_000);
    pending.key = PostKey::Pending(token.clone());
    pending.pending_token = Some(token.clone());
    pending.status = PostStatus::Pending;
    storage
        .apply_batch(&PostBatch {
            upserts: vec![pending.clone()],
            removals: Vec::new(),
        })
        .await
        .expect("pending");

    let mut confirmed = post("p-1", "c1", 1_200);
    confirmed.pending_token = Some(token);
    storage
        .apply_batch(&PostBatch {
            upserts: vec![confirmed.clone()],
            removals: vec![pending.key.clone()],
        })
        .await
        .expect("swap");

    assert!(storage.post(&pending.key).await.expect("lookup").is_none());
    let posts = storage
        .posts_in_channel(&ChannelId::new("c1"))
        .await
        .expect("posts");
    assert_eq!(posts, vec![confirmed]);
}

#[tokio::test]
async fn upsert_never_rolls_back_a_newer_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let original = post("p-1", "c1", 1_000);
    let mut tombstone = original.clone();
    tombstone.status = PostStatus::Deleted;
    tombstone.updated_at = millis_to_datetime(5_000);
    tombstone.deleted_at = Some(millis_to_datetime(5_000));
    for upserts in [vec![original.clone()], vec![tombstone.clone()], vec![original.clone()]] {
        storage
            .apply_batch(&PostBatch {
                upserts,
                removals: Vec::new(),
            })
            .await
            .expect("batch");
    }

    let mut same_stamp = original.clone();
    same_stamp.updated_at = millis_to_datetime(5_000);
    storage
        .apply_batch(&PostBatch {
            upserts: vec![same_stamp],
            removals: Vec::new(),
        })
        .await
        .expect("tie");

    let stored = storage.post(&original.key).await.expect("lookup").expect("row");
    assert_eq!(stored, tombstone);
    assert!(storage
        .posts_in_channel(&ChannelId::new("c1"))
        .await
        .expect("posts")
        .is_empty());
    let tombstones = storage
        .tombstones_in_channel(&ChannelId::new("c1"))
        .await
        .expect("tombstones");
    assert_eq!(tombstones, vec![tombstone]);
}

#[tokio::test]
async fn cursors_persist_without_prior_channel_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let channel_id = ChannelId::new("town-square");
    let cursors = PageCursors {
        oldest: Some(PostId::new("p-old")),
        newest: Some(PostId::new("p-new")),
        has_older: false,
        has_newer: true,
    };
    storage
        .save_cursors(&channel_id, &cursors)
        .await
        .expect("save cursors");

    let channel = storage
        .channel(&channel_id)
        .await
        .expect("channel")
        .expect("row");
    assert_eq!(channel.cursors, cursors);
    assert_eq!(channel.display_name, "");
}

#[tokio::test]
async fn upsert_channel_round_trips_and_keeps_last_viewed() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut channel = Channel::new(ChannelId::new("dev"), "Developers");
    channel.members = vec![UserId::new("alice"), UserId::new("bob")];
    channel.message_count = 42;
    storage.upsert_channel(&channel).await.expect("upsert");

    let viewed = millis_to_datetime(1_731_000_000_000);
    storage
        .set_last_viewed(&channel.id, viewed)
        .await
        .expect("viewed");

    let loaded = storage
        .channel(&channel.id)
        .await
        .expect("channel")
        .expect("row");
    assert_eq!(loaded.members, channel.members);
    assert_eq!(loaded.message_count, 42);
    assert_eq!(loaded.last_viewed_at, Some(viewed));

    let listed = storage.list_channels().await.expect("list");
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn file_metadata_fills_in_without_clobbering() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let key = PostKey::Confirmed(PostId::new("p-1"));
    let record = FileRecord::remote(FileId::new("f-1"), ChannelId::new("c1"), key.clone());
    storage.upsert_file(&record).await.expect("insert");

    let mut info = record.clone();
    info.post_key = None;
    info.mime_type = Some("image/png".into());
    info.size_bytes = Some(2048);
    info.name = Some("cat.png".into());
    storage.upsert_file(&info).await.expect("fill");

    let loaded = storage
        .file(&FileId::new("f-1"))
        .await
        .expect("file")
        .expect("row");
    assert_eq!(loaded.post_key, Some(key.clone()));
    assert_eq!(loaded.mime_type.as_deref(), Some("image/png"));
    assert_eq!(loaded.size_bytes, Some(2048));
    assert_eq!(loaded.state, FileTransferState::Remote);
    assert!(!loaded.needs_info());

    let for_post = storage.files_for_post(&key).await.expect("files");
    assert_eq!(for_post.len(), 1);
}
