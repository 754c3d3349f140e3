use std::sync::Arc;

use shared::domain::{ChannelId, FileId, PendingToken, Post, PostId, PostKey, PostStatus, UserId};
use tracing::{info, warn};

use crate::{
    error::{persistence, FeedError, FeedResult},
    feed::{next_update_time, now_millis, FeedState},
    merge::MergeDirection,
    transport::{PostDraft, RemoteFeedClient},
};

/// User-initiated post mutations with optimistic local state.
pub struct Outbox {
    remote: Arc<dyn RemoteFeedClient>,
    feed: Arc<FeedState>,
}

impl Outbox {
    pub fn new(remote: Arc<dyn RemoteFeedClient>, feed: Arc<FeedState>) -> Self {
        Self { remote, feed }
    }

    /// Shows a pending post right away, then sends it. On failure the pending
    /// post stays in the feed marked failed and the error is returned.
    pub async fn compose(
        &self,
        channel_id: &ChannelId,
        author_id: &UserId,
        body: &str,
        files: Vec<FileId>,
        root_id: Option<PostId>,
    ) -> FeedResult<Post> {
        let token = PendingToken::generate();
        let pending = Post::pending(
            token.clone(),
            channel_id.clone(),
            author_id.clone(),
            body,
            files,
            root_id,
            now_millis(),
        );
        self.feed.register_pending(channel_id, token.clone()).await?;
        self.feed
            .merge(channel_id, vec![pending.clone()], MergeDirection::Local)
            .await?;
        info!(channel_id = %channel_id, token = %token, "outbox: composed pending post");
        self.send(pending).await
    }

    /// Sends a failed post again with its original body and token.
    pub async fn resend(&self, channel_id: &ChannelId, token: &PendingToken) -> FeedResult<Post> {
        let key = PostKey::Pending(token.clone());
        let report = self
            .feed
            .modify_post(channel_id, &key, |post| post.status = PostStatus::Pending)
            .await?;
        let pending = report
            .snapshot
            .post(&key)
            .cloned()
            .ok_or(FeedError::UnknownPost(key))?;
        info!(channel_id = %channel_id, token = %token, "outbox: resending post");
        self.send(pending).await
    }

    async fn send(&self, pending: Post) -> FeedResult<Post> {
        let Some(token) = pending.pending_token.clone() else {
            return Err(FeedError::UnknownPost(pending.key));
        };
        let draft = PostDraft {
            channel_id: pending.channel_id.clone(),
            body: pending.body.clone(),
            root_id: pending.root_id.clone(),
            files: pending.files.clone(),
            pending_token: token.clone(),
        };

        match self.remote.create_post(&draft).await {
            Ok(mut confirmed) => {
                if confirmed.pending_token.is_none() {
                    confirmed.pending_token = Some(token);
                }
                self.feed
                    .merge(&pending.channel_id, vec![confirmed.clone()], MergeDirection::Local)
                    .await?;
                info!(
                    channel_id = %pending.channel_id,
                    post_key = %confirmed.key,
                    "outbox: post confirmed"
                );
                Ok(confirmed)
            }
            Err(err) => {
                warn!(
                    channel_id = %pending.channel_id,
                    token = %token,
                    error = %err,
                    retryable = err.is_retryable(),
                    "outbox: send failed"
                );
                let marked = self
                    .feed
                    .modify_post(&pending.channel_id, &pending.key, |post| {
                        post.status = PostStatus::Failed
                    })
                    .await;
                match marked {
                    // Confirmed meanwhile through the realtime path.
                    Err(FeedError::UnknownPost(_)) => {}
                    Err(mark_err) => {
                        warn!(error = %mark_err, "outbox: could not mark post failed");
                    }
                    Ok(_) => {}
                }
                Err(err)
            }
        }
    }

    pub async fn edit(&self, channel_id: &ChannelId, post_id: &PostId, body: &str) -> FeedResult<Post> {
        let key = PostKey::Confirmed(post_id.clone());
        let snapshot = self.feed.snapshot(channel_id).await?;
        let mut post = snapshot
            .post(&key)
            .cloned()
            .ok_or(FeedError::UnknownPost(key))?;
        post.body = body.to_string();

        let updated = self.remote.update_post(&post).await?;
        self.feed
            .merge(channel_id, vec![updated.clone()], MergeDirection::Local)
            .await?;
        info!(channel_id = %channel_id, post_id = %post_id, "outbox: post edited");
        Ok(updated)
    }

    pub async fn delete(&self, channel_id: &ChannelId, post_id: &PostId) -> FeedResult<()> {
        let key = PostKey::Confirmed(post_id.clone());
        let snapshot = self.feed.snapshot(channel_id).await?;
        let mut tombstone = snapshot
            .post(&key)
            .cloned()
            .ok_or(FeedError::UnknownPost(key))?;

        self.remote.delete_post(post_id).await?;

        let deleted_at = next_update_time(tombstone.updated_at);
        tombstone.status = PostStatus::Deleted;
        tombstone.updated_at = deleted_at;
        tombstone.deleted_at = Some(deleted_at);
        self.feed
            .merge(channel_id, vec![tombstone], MergeDirection::Local)
            .await?;
        info!(channel_id = %channel_id, post_id = %post_id, "outbox: post deleted");
        Ok(())
    }

    /// Remote search. Hits are returned in feed order and not merged.
    pub async fn search(&self, term: &str, channel_id: &ChannelId) -> FeedResult<Vec<Post>> {
        let mut hits = self.remote.search_posts(term, channel_id).await?;
        hits.sort_by(Post::cmp_order);
        info!(channel_id = %channel_id, hits = hits.len(), "outbox: search finished");
        Ok(hits)
    }

    pub async fn mark_viewed(&self, channel_id: &ChannelId) -> FeedResult<()> {
        self.remote.mark_channel_viewed(channel_id).await?;
        self.feed
            .store()
            .set_last_viewed(channel_id, now_millis())
            .await
            .map_err(persistence)
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
