use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::{ChannelId, FileId, PendingToken, Post, PostId},
    error::ApiError,
    protocol::{
        CreatePostRequest, FileInfoPayload, PostListResponse, PostPayload, SearchPostsRequest,
        UpdatePostRequest,
    },
};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{FeedError, FeedResult};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Direction of an anchor-relative page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Older,
    Newer,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Older => "older",
            Direction::Newer => "newer",
        }
    }
}

/// One bounded, ascending batch of posts returned by a fetch.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub posts: Vec<Post>,
    pub returned_count: usize,
    pub requested_size: usize,
}

impl Page {
    pub fn new(mut posts: Vec<Post>, returned_count: usize, requested_size: usize) -> Self {
        posts.sort_by(Post::cmp_order);
        Self {
            posts,
            returned_count,
            requested_size,
        }
    }

    /// A short page means the server has nothing further in this direction.
    pub fn is_last_page(&self) -> bool {
        self.returned_count < self.requested_size
    }
}

/// Outgoing post before the server has assigned it an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDraft {
    pub channel_id: ChannelId,
    pub body: String,
    pub root_id: Option<PostId>,
    pub files: Vec<FileId>,
    pub pending_token: PendingToken,
}

/// Call contract of the remote feed service. No caching, no retries.
#[async_trait]
pub trait RemoteFeedClient: Send + Sync {
    async fn fetch_first_page(&self, channel_id: &ChannelId, size: usize) -> FeedResult<Page>;
    async fn fetch_page(
        &self,
        channel_id: &ChannelId,
        anchor: &PostId,
        direction: Direction,
        size: usize,
    ) -> FeedResult<Page>;
    async fn create_post(&self, draft: &PostDraft) -> FeedResult<Post>;
    async fn update_post(&self, post: &Post) -> FeedResult<Post>;
    async fn delete_post(&self, post_id: &PostId) -> FeedResult<()>;
    async fn search_posts(&self, term: &str, channel_id: &ChannelId) -> FeedResult<Vec<Post>>;
    async fn fetch_file_info(&self, file_id: &FileId) -> FeedResult<FileInfoPayload>;
    async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> FeedResult<()>;
}

/// Bytes of one outgoing attachment.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub client_id: String,
    pub channel_id: ChannelId,
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub type ProgressFn = dyn Fn(f64) + Send + Sync;

#[async_trait]
pub trait AttachmentTransport: Send + Sync {
    /// Uploads one attachment, reporting progress in `[0, 1]`. The upload
    /// should stop early once `cancel` flips to `true`.
    async fn upload(
        &self,
        upload: &AttachmentUpload,
        progress: &ProgressFn,
        cancel: watch::Receiver<bool>,
    ) -> FeedResult<FileInfoPayload>;
}

#[derive(Serialize)]
struct PageQuery<'a> {
    per_page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a str>,
}

#[derive(Serialize)]
struct UploadQuery<'a> {
    channel_id: &'a str,
    client_id: &'a str,
    filename: &'a str,
}

/// `RemoteFeedClient` over the service's JSON REST surface.
#[derive(Clone)]
pub struct HttpFeedClient {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpFeedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, None)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> FeedResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FeedError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(http, base_url, auth_token))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}/{path}", self.base_url));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_page(
        &self,
        channel_id: &ChannelId,
        query: PageQuery<'_>,
    ) -> FeedResult<Page> {
        let requested = query.per_page;
        let response = self
            .request(Method::GET, &format!("channels/{channel_id}/posts"))
            .query(&query)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(FeedError::NoMoreData);
        }
        let list: PostListResponse = ensure_success(response).await?.json().await?;
        let returned = list.returned_count();
        debug!(
            channel_id = %channel_id,
            returned,
            requested,
            "transport: page received"
        );
        Ok(Page::new(list.into_posts(), returned, requested))
    }
}

#[async_trait]
impl RemoteFeedClient for HttpFeedClient {
    async fn fetch_first_page(&self, channel_id: &ChannelId, size: usize) -> FeedResult<Page> {
        self.get_page(
            channel_id,
            PageQuery {
                per_page: size,
                page: Some(0),
                before: None,
                after: None,
            },
        )
        .await
    }

    async fn fetch_page(
        &self,
        channel_id: &ChannelId,
        anchor: &PostId,
        direction: Direction,
        size: usize,
    ) -> FeedResult<Page> {
        let (before, after) = match direction {
            Direction::Older => (Some(anchor.as_str()), None),
            Direction::Newer => (None, Some(anchor.as_str())),
        };
        self.get_page(
            channel_id,
            PageQuery {
                per_page: size,
                page: None,
                before,
                after,
            },
        )
        .await
    }

    async fn create_post(&self, draft: &PostDraft) -> FeedResult<Post> {
        let payload: PostPayload = ensure_success(
            self.request(Method::POST, "posts")
                .json(&CreatePostRequest {
                    channel_id: draft.channel_id.clone(),
                    message: draft.body.clone(),
                    root_id: draft.root_id.clone(),
                    file_ids: draft.files.clone(),
                    pending_post_id: draft.pending_token.clone(),
                })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(payload.into_post())
    }

    async fn update_post(&self, post: &Post) -> FeedResult<Post> {
        let id = post
            .confirmed_id()
            .ok_or_else(|| FeedError::UnknownPost(post.key.clone()))?;
        let payload: PostPayload = ensure_success(
            self.request(Method::PUT, &format!("posts/{id}"))
                .json(&UpdatePostRequest {
                    id: id.clone(),
                    message: post.body.clone(),
                    file_ids: post.files.clone(),
                })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(payload.into_post())
    }

    async fn delete_post(&self, post_id: &PostId) -> FeedResult<()> {
        ensure_success(
            self.request(Method::DELETE, &format!("posts/{post_id}"))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn search_posts(&self, term: &str, channel_id: &ChannelId) -> FeedResult<Vec<Post>> {
        let response = self
            .request(Method::POST, &format!("channels/{channel_id}/posts/search"))
            .json(&SearchPostsRequest {
                terms: term.to_string(),
            })
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let list: PostListResponse = ensure_success(response).await?.json().await?;
        Ok(list.into_posts())
    }

    async fn fetch_file_info(&self, file_id: &FileId) -> FeedResult<FileInfoPayload> {
        let info = ensure_success(
            self.request(Method::GET, &format!("files/{file_id}/info"))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(info)
    }

    async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> FeedResult<()> {
        ensure_success(
            self.request(Method::POST, &format!("channels/{channel_id}/viewed"))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AttachmentTransport for HttpFeedClient {
    async fn upload(
        &self,
        upload: &AttachmentUpload,
        progress: &ProgressFn,
        cancel: watch::Receiver<bool>,
    ) -> FeedResult<FileInfoPayload> {
        let total = upload.bytes.len().max(1) as f64;
        let chunks: Vec<Vec<u8>> = upload
            .bytes
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        let (sent_tx, mut sent_rx) = watch::channel(0usize);
        let body_cancel = cancel.clone();
        let body = stream::iter(chunks.into_iter().map(move |chunk| {
            if *body_cancel.borrow() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "upload cancelled",
                ));
            }
            sent_tx.send_modify(|sent| *sent += chunk.len());
            Ok::<_, std::io::Error>(chunk)
        }));

        let mut request = self
            .request(Method::POST, "files")
            .query(&UploadQuery {
                channel_id: upload.channel_id.as_str(),
                client_id: &upload.client_id,
                filename: &upload.filename,
            })
            .body(reqwest::Body::wrap_stream(body));
        if let Some(mime) = &upload.mime_type {
            request = request.header(reqwest::header::CONTENT_TYPE, mime.as_str());
        }

        progress(0.0);
        let send = request.send();
        tokio::pin!(send);
        let response = loop {
            tokio::select! {
                result = &mut send => break result?,
                changed = sent_rx.changed() => {
                    if changed.is_err() {
                        break (&mut send).await?;
                    }
                    let sent = *sent_rx.borrow_and_update();
                    progress((sent as f64 / total).min(1.0));
                }
            }
        };

        if *cancel.borrow() {
            warn!(client_id = %upload.client_id, "transport: upload finished after cancellation");
        }
        let info: FileInfoPayload = ensure_success(response).await?.json().await?;
        progress(1.0);
        Ok(info)
    }
}

/// Maps non-2xx responses onto `FeedError`, recognizing the no-more-data body.
async fn ensure_success(response: Response) -> FeedResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api) if api.is_no_more_data() => Err(FeedError::NoMoreData),
        Ok(api) => Err(FeedError::Rejected {
            status: status.as_u16(),
            code: serde_json::to_value(api.code)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string)),
            message: api.message,
        }),
        Err(_) => Err(FeedError::Rejected {
            status: status.as_u16(),
            code: None,
            message: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        }),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
