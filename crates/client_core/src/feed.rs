use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use shared::{
    domain::{ChannelId, FileId, PendingToken, Post, PostId, PostKey, UserId},
    protocol::millis_to_datetime,
};
use storage::LocalMessageStore;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};

use crate::{
    error::{persistence, FeedError, FeedResult},
    merge::{MergeDirection, MergeEngine, MergeOutcome},
    sections::{Section, SectionIndex},
};

/// Immutable view of one channel, replaced wholesale after every merge.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    pub channel_id: ChannelId,
    pub posts: Vec<Post>,
    pub sections: Vec<Section>,
}

impl FeedSnapshot {
    fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            posts: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn post(&self, key: &PostKey) -> Option<&Post> {
        self.posts.iter().find(|post| &post.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Merged {
        channel_id: ChannelId,
        direction: MergeDirection,
        changed: Vec<PostKey>,
        removed: Vec<PostKey>,
    },
    TypingChanged {
        channel_id: ChannelId,
        typing: Vec<UserId>,
    },
}

/// What one merge did, as seen by the caller.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub changed: Vec<PostKey>,
    pub removed: Vec<PostKey>,
    pub retired: Vec<(PendingToken, PostId)>,
    pub snapshot: Arc<FeedSnapshot>,
}

struct ChannelFeed {
    loaded: bool,
    posts: Vec<Post>,
    sections: SectionIndex,
    engine: MergeEngine,
}

struct ChannelSlot {
    writer: Mutex<ChannelFeed>,
    publisher: watch::Sender<Arc<FeedSnapshot>>,
}

/// Owner of every channel's in-memory feed.
///
/// Each channel is a single writer domain: pagination, realtime, outbox and
/// upload completion all merge through `FeedState`, and merges for one
/// channel never interleave. Readers get `Arc<FeedSnapshot>` values through
/// a `watch` channel.
pub struct FeedState {
    store: Arc<dyn LocalMessageStore>,
    section_offset: FixedOffset,
    channels: Mutex<HashMap<ChannelId, Arc<ChannelSlot>>>,
    events: broadcast::Sender<FeedEvent>,
}

impl FeedState {
    pub fn new(store: Arc<dyn LocalMessageStore>, section_offset: FixedOffset) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            section_offset,
            channels: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalMessageStore> {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: FeedEvent) {
        let _ = self.events.send(event);
    }

    async fn slot(&self, channel_id: &ChannelId) -> Arc<ChannelSlot> {
        let mut channels = self.channels.lock().await;
        Arc::clone(channels.entry(channel_id.clone()).or_insert_with(|| {
            let (publisher, _) = watch::channel(Arc::new(FeedSnapshot::empty(channel_id.clone())));
            Arc::new(ChannelSlot {
                writer: Mutex::new(ChannelFeed {
                    loaded: false,
                    posts: Vec::new(),
                    sections: SectionIndex::new(self.section_offset),
                    engine: MergeEngine::new(),
                }),
                publisher,
            })
        }))
    }

    /// Loads the channel from the local store on first use.
    async fn ensure_loaded(
        &self,
        channel_id: &ChannelId,
        slot: &ChannelSlot,
        feed: &mut ChannelFeed,
    ) -> FeedResult<()> {
        if feed.loaded {
            return Ok(());
        }
        let posts = self
            .store
            .posts_in_channel(channel_id)
            .await
            .map_err(persistence)?;
        for post in &posts {
            if let PostKey::Pending(token) = &post.key {
                feed.engine.register_pending(token.clone());
            }
        }
        let tombstones = self
            .store
            .tombstones_in_channel(channel_id)
            .await
            .map_err(persistence)?;
        for tombstone in tombstones {
            feed.engine.record_deleted(tombstone.key, tombstone.updated_at);
        }
        feed.sections.rebuild(&posts);
        feed.posts = posts;
        feed.loaded = true;
        slot.publisher.send_replace(Arc::new(FeedSnapshot {
            channel_id: channel_id.clone(),
            posts: feed.posts.clone(),
            sections: feed.sections.sections().to_vec(),
        }));
        debug!(channel_id = %channel_id, posts = feed.posts.len(), "feed: loaded channel from store");
        Ok(())
    }

    pub async fn snapshot(&self, channel_id: &ChannelId) -> FeedResult<Arc<FeedSnapshot>> {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;
        let snapshot = slot.publisher.borrow().clone();
        Ok(snapshot)
    }

    pub async fn subscribe(
        &self,
        channel_id: &ChannelId,
    ) -> FeedResult<watch::Receiver<Arc<FeedSnapshot>>> {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;
        Ok(slot.publisher.subscribe())
    }

    pub async fn register_pending(&self, channel_id: &ChannelId, token: PendingToken) -> FeedResult<()> {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;
        feed.engine.register_pending(token);
        Ok(())
    }

    pub async fn resolved(&self, channel_id: &ChannelId, token: &PendingToken) -> Option<PostId> {
        let slot = self.slot(channel_id).await;
        let feed = slot.writer.lock().await;
        feed.engine.resolved(token).cloned()
    }

    /// Merges `incoming` into the channel, persists the result and publishes
    /// the new snapshot. Nothing is published when persistence fails.
    pub async fn merge(
        &self,
        channel_id: &ChannelId,
        incoming: Vec<Post>,
        direction: MergeDirection,
    ) -> FeedResult<MergeReport> {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;
        self.merge_locked(channel_id, &slot, &mut feed, incoming, direction)
            .await
    }

    /// Rewrites one post in place through the merge path. The closure sees a
    /// copy; its `updated_at` is bumped so the edit wins last-writer-wins.
    pub async fn modify_post<F>(
        &self,
        channel_id: &ChannelId,
        key: &PostKey,
        edit: F,
    ) -> FeedResult<MergeReport>
    where
        F: FnOnce(&mut Post) + Send,
    {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;
        let mut post = feed
            .posts
            .iter()
            .find(|post| &post.key == key)
            .cloned()
            .ok_or_else(|| FeedError::UnknownPost(key.clone()))?;
        edit(&mut post);
        post.updated_at = next_update_time(post.updated_at);
        self.merge_locked(channel_id, &slot, &mut feed, vec![post], MergeDirection::Local)
            .await
    }

    /// Adds an uploaded file to the post created by the send behind `token`,
    /// whether it is still pending or already confirmed.
    pub async fn attach_file(
        &self,
        channel_id: &ChannelId,
        token: &PendingToken,
        file_id: FileId,
    ) -> FeedResult<MergeReport> {
        let slot = self.slot(channel_id).await;
        let mut feed = slot.writer.lock().await;
        self.ensure_loaded(channel_id, &slot, &mut feed).await?;

        let key = owning_key(&feed, token);
        let mut post = feed
            .posts
            .iter()
            .find(|post| post.key == key)
            .cloned()
            .ok_or(FeedError::UnknownPost(key))?;
        if post.files.contains(&file_id) {
            return Ok(MergeReport {
                changed: Vec::new(),
                removed: Vec::new(),
                retired: Vec::new(),
                snapshot: slot.publisher.borrow().clone(),
            });
        }
        post.files.push(file_id);
        post.updated_at = next_update_time(post.updated_at);
        self.merge_locked(channel_id, &slot, &mut feed, vec![post], MergeDirection::Local)
            .await
    }

    /// Key of the post that currently stands for the send behind `token`.
    pub async fn owning_key(&self, channel_id: &ChannelId, token: &PendingToken) -> PostKey {
        let slot = self.slot(channel_id).await;
        let feed = slot.writer.lock().await;
        owning_key(&feed, token)
    }

    async fn merge_locked(
        &self,
        channel_id: &ChannelId,
        slot: &ChannelSlot,
        feed: &mut ChannelFeed,
        incoming: Vec<Post>,
        direction: MergeDirection,
    ) -> FeedResult<MergeReport> {
        let received = incoming.len();
        let outcome = feed.engine.merge(&feed.posts, incoming, direction);
        if outcome.is_noop() {
            feed.engine.commit(&outcome);
            debug!(
                channel_id = %channel_id,
                direction = direction.as_str(),
                received,
                "feed: merge produced no changes"
            );
            return Ok(MergeReport {
                changed: Vec::new(),
                removed: Vec::new(),
                retired: outcome.retired,
                snapshot: slot.publisher.borrow().clone(),
            });
        }

        self.store
            .apply_batch(&outcome.batch())
            .await
            .map_err(persistence)?;

        let MergeOutcome {
            snapshot: posts,
            changed,
            removed,
            retired,
            registered,
            tombstones,
        } = outcome;
        let tombstone_count = tombstones.len();
        feed.engine.commit(&MergeOutcome {
            retired: retired.clone(),
            registered,
            tombstones,
            ..MergeOutcome::default()
        });
        feed.sections.apply_change(&changed, &removed, &posts);
        feed.posts = posts;

        let snapshot = Arc::new(FeedSnapshot {
            channel_id: channel_id.clone(),
            posts: feed.posts.clone(),
            sections: feed.sections.sections().to_vec(),
        });
        slot.publisher.send_replace(Arc::clone(&snapshot));

        info!(
            channel_id = %channel_id,
            direction = direction.as_str(),
            received,
            changed = changed.len(),
            removed = removed.len(),
            tombstones = tombstone_count,
            retired = retired.len(),
            "feed: merged posts"
        );
        self.emit(FeedEvent::Merged {
            channel_id: channel_id.clone(),
            direction,
            changed: changed.clone(),
            removed: removed.clone(),
        });

        Ok(MergeReport {
            changed,
            removed,
            retired,
            snapshot,
        })
    }
}

fn owning_key(feed: &ChannelFeed, token: &PendingToken) -> PostKey {
    match feed.engine.resolved(token) {
        Some(id) => PostKey::Confirmed(id.clone()),
        None => PostKey::Pending(token.clone()),
    }
}

/// Current time at the millisecond precision the store keeps.
pub fn now_millis() -> DateTime<Utc> {
    millis_to_datetime(Utc::now().timestamp_millis())
}

/// Update stamp for a local edit, strictly after `previous`.
pub(crate) fn next_update_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    now_millis().max(previous + Duration::milliseconds(1))
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
