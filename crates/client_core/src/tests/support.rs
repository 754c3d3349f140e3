use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::FixedOffset;
use shared::{
    domain::{ChannelId, FileId, Post, PostId, PostKey, PostKind, PostStatus, UserId},
    protocol::{millis_to_datetime, FileInfoPayload},
};
use storage::Storage;
use tokio::sync::{watch, Notify};

use crate::{
    error::{FeedError, FeedResult},
    feed::{now_millis, FeedState},
    transport::{
        AttachmentTransport, AttachmentUpload, Direction, Page, PostDraft, ProgressFn,
        RemoteFeedClient,
    },
};

pub(crate) const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// 2024-03-01T00:00:00Z
pub(crate) const BASE_MS: i64 = 1_709_251_200_000;

pub(crate) fn confirmed(id: &str, channel: &str, author: &str, created_ms: i64) -> Post {
    Post {
        key: PostKey::Confirmed(PostId::new(id)),
        pending_token: None,
        channel_id: ChannelId::new(channel),
        author_id: UserId::new(author),
        root_id: None,
        created_at: millis_to_datetime(created_ms),
        updated_at: millis_to_datetime(created_ms),
        deleted_at: None,
        body: format!("body {id}"),
        status: PostStatus::Sent,
        files: Vec::new(),
        kind: PostKind::Common,
    }
}

/// `count` posts one minute apart by alternating authors, oldest first.
pub(crate) fn run_of_posts(prefix: &str, channel: &str, start_ms: i64, count: usize) -> Vec<Post> {
    (0..count)
        .map(|i| {
            let author = if i % 2 == 0 { "alice" } else { "bob" };
            confirmed(
                &format!("{prefix}-{i:03}"),
                channel,
                author,
                start_ms + i as i64 * 60_000,
            )
        })
        .collect()
}

pub(crate) fn page(posts: Vec<Post>, requested: usize) -> Page {
    let returned = posts.len();
    Page::new(posts, returned, requested)
}

pub(crate) fn keys(posts: &[Post]) -> Vec<PostKey> {
    posts.iter().map(|post| post.key.clone()).collect()
}

pub(crate) fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).expect("utc offset")
}

pub(crate) async fn memory_feed() -> (Arc<Storage>, Arc<FeedState>) {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("db"));
    let feed = Arc::new(FeedState::new(storage.clone(), utc()));
    (storage, feed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    First(ChannelId, usize),
    Page(ChannelId, PostId, Direction, usize),
    Create(PostDraft),
    Update(PostId, String),
    Delete(PostId),
    Search(String),
    FileInfo(FileId),
    Viewed(ChannelId),
}

/// In-process `RemoteFeedClient` answering from queued results.
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    pages: Mutex<VecDeque<FeedResult<Page>>>,
    creates: Mutex<VecDeque<FeedResult<Post>>>,
    search_hits: Mutex<Vec<Post>>,
    calls: Mutex<Vec<Call>>,
    hold: Mutex<Option<Arc<Notify>>>,
    next_id: Mutex<u32>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_page(&self, page: FeedResult<Page>) {
        self.pages.lock().expect("pages").push_back(page);
    }

    pub(crate) fn push_create(&self, result: FeedResult<Post>) {
        self.creates.lock().expect("creates").push_back(result);
    }

    pub(crate) fn set_search_hits(&self, hits: Vec<Post>) {
        *self.search_hits.lock().expect("hits") = hits;
    }

    /// Page fetches block until the returned `Notify` is signalled.
    pub(crate) fn hold_fetches(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().expect("hold") = Some(notify.clone());
        notify
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls").push(call);
    }

    async fn next_page(&self) -> FeedResult<Page> {
        let hold = self.hold.lock().expect("hold").clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        self.pages
            .lock()
            .expect("pages")
            .pop_front()
            .unwrap_or(Err(FeedError::NoMoreData))
    }
}

#[async_trait]
impl RemoteFeedClient for ScriptedRemote {
    async fn fetch_first_page(&self, channel_id: &ChannelId, size: usize) -> FeedResult<Page> {
        self.record(Call::First(channel_id.clone(), size));
        self.next_page().await
    }

    async fn fetch_page(
        &self,
        channel_id: &ChannelId,
        anchor: &PostId,
        direction: Direction,
        size: usize,
    ) -> FeedResult<Page> {
        self.record(Call::Page(channel_id.clone(), anchor.clone(), direction, size));
        self.next_page().await
    }

    async fn create_post(&self, draft: &PostDraft) -> FeedResult<Post> {
        self.record(Call::Create(draft.clone()));
        if let Some(result) = self.creates.lock().expect("creates").pop_front() {
            return result;
        }
        let mut next = self.next_id.lock().expect("next id");
        *next += 1;
        let now = now_millis();
        Ok(Post {
            key: PostKey::Confirmed(PostId::new(format!("srv-{next}"))),
            pending_token: Some(draft.pending_token.clone()),
            channel_id: draft.channel_id.clone(),
            author_id: UserId::new("alice"),
            root_id: draft.root_id.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            body: draft.body.clone(),
            status: PostStatus::Sent,
            files: draft.files.clone(),
            kind: PostKind::Common,
        })
    }

    async fn update_post(&self, post: &Post) -> FeedResult<Post> {
        let id = post.confirmed_id().cloned().expect("confirmed post");
        self.record(Call::Update(id, post.body.clone()));
        let mut updated = post.clone();
        updated.updated_at = post.updated_at + chrono::Duration::seconds(1);
        Ok(updated)
    }

    async fn delete_post(&self, post_id: &PostId) -> FeedResult<()> {
        self.record(Call::Delete(post_id.clone()));
        Ok(())
    }

    async fn search_posts(&self, term: &str, _channel_id: &ChannelId) -> FeedResult<Vec<Post>> {
        self.record(Call::Search(term.to_string()));
        Ok(self.search_hits.lock().expect("hits").clone())
    }

    async fn fetch_file_info(&self, file_id: &FileId) -> FeedResult<FileInfoPayload> {
        self.record(Call::FileInfo(file_id.clone()));
        Ok(FileInfoPayload {
            id: file_id.clone(),
            post_id: None,
            name: format!("{file_id}.png"),
            extension: Some("png".into()),
            size: 1024,
            mime_type: Some("image/png".into()),
        })
    }

    async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> FeedResult<()> {
        self.record(Call::Viewed(channel_id.clone()));
        Ok(())
    }
}

/// Attachment transport that reports scripted progress and can be held open.
pub(crate) struct ScriptedUploads {
    pub(crate) progress_steps: Vec<f64>,
    pub(crate) release: Arc<Notify>,
    pub(crate) held: bool,
    pub(crate) fail: bool,
}

impl ScriptedUploads {
    pub(crate) fn immediate(progress_steps: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            progress_steps,
            release: Arc::new(Notify::new()),
            held: false,
            fail: false,
        })
    }

    pub(crate) fn held() -> Arc<Self> {
        Arc::new(Self {
            progress_steps: vec![0.5],
            release: Arc::new(Notify::new()),
            held: true,
            fail: false,
        })
    }
}

#[async_trait]
impl AttachmentTransport for ScriptedUploads {
    async fn upload(
        &self,
        upload: &AttachmentUpload,
        progress: &ProgressFn,
        _cancel: watch::Receiver<bool>,
    ) -> FeedResult<FileInfoPayload> {
        for step in &self.progress_steps {
            progress(*step);
        }
        if self.held {
            self.release.notified().await;
        }
        if self.fail {
            return Err(FeedError::Transport("connection reset".into()));
        }
        Ok(FileInfoPayload {
            id: FileId::new(format!("file-{}", upload.client_id)),
            post_id: None,
            name: upload.filename.clone(),
            extension: None,
            size: upload.bytes.len() as u64,
            mime_type: upload.mime_type.clone(),
        })
    }
}
