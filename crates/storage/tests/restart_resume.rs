use shared::{
    domain::{ChannelId, PageCursors, Post, PostId, PostKey, PostKind, PostStatus, UserId},
    protocol::millis_to_datetime,
};
use storage::{LocalMessageStore, PostBatch, Storage};

fn sent_post(id: &str, created_ms: i64) -> Post {
    Post {
        key: PostKey::Confirmed(PostId::new(id)),
        pending_token: None,
        channel_id: ChannelId::new("general"),
        author_id: UserId::new("carol"),
        root_id: None,
        created_at: millis_to_datetime(created_ms),
        updated_at: millis_to_datetime(created_ms),
        deleted_at: None,
        body: format!("message {id}"),
        status: PostStatus::Sent,
        files: Vec::new(),
        kind: PostKind::Common,
    }
}

#[tokio::test]
async fn posts_and_cursors_survive_reopening_the_database() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("feed_restart_test_{suffix}"));
    let db_path = temp_root.join("feed.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let channel_id = ChannelId::new("general");

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage
            .apply_batch(&PostBatch {
                upserts: vec![sent_post("p-2", 2_000), sent_post("p-1", 1_000)],
                removals: Vec::new(),
            })
            .await
            .expect("batch");
        storage
            .save_cursors(
                &channel_id,
                &PageCursors {
                    oldest: Some(PostId::new("p-1")),
                    newest: Some(PostId::new("p-2")),
                    has_older: true,
                    has_newer: false,
                },
            )
            .await
            .expect("cursors");
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let channel = reopened
        .channel(&channel_id)
        .await
        .expect("channel")
        .expect("persisted channel row");
    assert_eq!(channel.cursors.oldest, Some(PostId::new("p-1")));
    assert!(channel.cursors.has_older);

    let posts = reopened
        .posts_in_channel(&channel_id)
        .await
        .expect("posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].key, PostKey::Confirmed(PostId::new("p-1")));
    reopened.pool().close().await;

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
