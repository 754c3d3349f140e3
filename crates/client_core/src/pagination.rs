use std::{
    cmp::Ordering,
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::{ChannelId, FileRecord, PageCursors, Post, PostId, PostKey};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{persistence, FeedError, FeedResult},
    feed::FeedState,
    merge::MergeDirection,
    transport::{Direction, Page, RemoteFeedClient},
};

pub const DEFAULT_PAGE_SIZE: usize = 60;
pub const SHORT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    LoadingFirst,
    LoadingOlder,
    LoadingNewer,
}

impl LoadState {
    fn as_str(self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::LoadingFirst => "loading_first",
            LoadState::LoadingOlder => "loading_older",
            LoadState::LoadingNewer => "loading_newer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub channel_id: ChannelId,
    pub direction: MergeDirection,
    pub received: usize,
    pub is_last_page: bool,
    pub cursors: PageCursors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(PageSummary),
    /// The channel already had a load in flight.
    Skipped,
    /// The channel stopped being active before the response was merged.
    Cancelled,
}

impl LoadOutcome {
    pub fn summary(&self) -> Option<&PageSummary> {
        match self {
            LoadOutcome::Loaded(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AroundOutcome {
    pub older: LoadOutcome,
    pub newer: LoadOutcome,
}

struct ChannelLoad {
    state: LoadState,
    generation: watch::Sender<u64>,
    cursors: Option<PageCursors>,
}

impl ChannelLoad {
    fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: LoadState::Idle,
            generation,
            cursors: None,
        }
    }
}

/// Resets the channel to idle when a load ends, however it ends, unless the
/// channel was cancelled and moved on to a newer generation meanwhile.
struct LoadGuard<'a> {
    controller: &'a PaginationController,
    channel_id: ChannelId,
    generation: u64,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut loads = self.controller.loads();
        if let Some(load) = loads.get_mut(&self.channel_id) {
            if *load.generation.borrow() == self.generation {
                load.state = LoadState::Idle;
            }
        }
    }
}

/// Drives page loads per channel and owns cursors and exhaustion flags.
pub struct PaginationController {
    remote: Arc<dyn RemoteFeedClient>,
    feed: Arc<FeedState>,
    page_size: usize,
    short_page_size: usize,
    loads: Mutex<HashMap<ChannelId, ChannelLoad>>,
    active: Mutex<Option<ChannelId>>,
}

impl PaginationController {
    pub fn new(remote: Arc<dyn RemoteFeedClient>, feed: Arc<FeedState>) -> Self {
        Self::with_page_sizes(remote, feed, DEFAULT_PAGE_SIZE, SHORT_PAGE_SIZE)
    }

    pub fn with_page_sizes(
        remote: Arc<dyn RemoteFeedClient>,
        feed: Arc<FeedState>,
        page_size: usize,
        short_page_size: usize,
    ) -> Self {
        Self {
            remote,
            feed,
            page_size: page_size.max(1),
            short_page_size: short_page_size.max(1),
            loads: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    fn loads(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelLoad>> {
        self.loads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, channel_id: &ChannelId) -> LoadState {
        self.loads()
            .get(channel_id)
            .map(|load| load.state)
            .unwrap_or(LoadState::Idle)
    }

    pub fn active_channel(&self) -> Option<ChannelId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switches the active channel, cancelling whatever the previous one had
    /// in flight.
    pub fn set_active_channel(&self, channel_id: ChannelId) {
        let previous = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.replace(channel_id.clone())
        };
        match previous {
            Some(previous) if previous != channel_id => self.cancel(&previous),
            _ => {}
        }
    }

    /// Bumps the channel's generation so any in-flight load resolves to
    /// `LoadOutcome::Cancelled`.
    pub fn cancel(&self, channel_id: &ChannelId) {
        let mut loads = self.loads();
        let Some(load) = loads.get_mut(channel_id) else {
            return;
        };
        let was = load.state;
        load.generation.send_modify(|generation| *generation += 1);
        load.state = LoadState::Idle;
        if was != LoadState::Idle {
            info!(
                channel_id = %channel_id,
                state = was.as_str(),
                generation = *load.generation.borrow(),
                "pagination: cancelled in-flight load"
            );
        }
    }

    /// Current cursors of a channel: in-memory first, then the persisted row.
    pub async fn cursors(&self, channel_id: &ChannelId) -> FeedResult<PageCursors> {
        let cached = self
            .loads()
            .get(channel_id)
            .and_then(|load| load.cursors.clone());
        if let Some(cursors) = cached {
            return Ok(cursors);
        }
        let stored = self
            .feed
            .store()
            .channel(channel_id)
            .await
            .map_err(persistence)?
            .map(|channel| channel.cursors)
            .unwrap_or_default();
        self.remember_cursors(channel_id, &stored);
        Ok(stored)
    }

    pub async fn load_first(&self, channel_id: &ChannelId) -> FeedResult<LoadOutcome> {
        let size = self.page_size;
        let outcome = self
            .run_load(
                channel_id,
                LoadState::LoadingFirst,
                MergeDirection::First,
                size,
                self.remote.fetch_first_page(channel_id, size),
            )
            .await?;
        if let LoadOutcome::Loaded(_) = &outcome {
            self.backfill_file_info(channel_id).await;
        }
        Ok(outcome)
    }

    /// Loads the page before `anchor`, or before the persisted oldest cursor
    /// when no anchor is given.
    pub async fn load_older(
        &self,
        channel_id: &ChannelId,
        anchor: Option<PostId>,
    ) -> FeedResult<LoadOutcome> {
        self.load_relative(channel_id, anchor, Direction::Older, self.page_size)
            .await
    }

    /// Loads the page after `anchor`, or after the persisted newest cursor
    /// when no anchor is given.
    pub async fn load_newer(
        &self,
        channel_id: &ChannelId,
        anchor: Option<PostId>,
    ) -> FeedResult<LoadOutcome> {
        self.load_relative(channel_id, anchor, Direction::Newer, self.page_size)
            .await
    }

    /// Jump to a post found by search: merge the hit, then a short page on
    /// each side of it.
    pub async fn load_around(&self, channel_id: &ChannelId, anchor: &Post) -> FeedResult<AroundOutcome> {
        let anchor_id = anchor
            .confirmed_id()
            .cloned()
            .ok_or_else(|| FeedError::UnknownPost(anchor.key.clone()))?;
        self.feed
            .merge(channel_id, vec![anchor.clone()], MergeDirection::Local)
            .await?;
        let older = self
            .load_relative(
                channel_id,
                Some(anchor_id.clone()),
                Direction::Older,
                self.short_page_size,
            )
            .await?;
        let newer = self
            .load_relative(
                channel_id,
                Some(anchor_id),
                Direction::Newer,
                self.short_page_size,
            )
            .await?;
        Ok(AroundOutcome { older, newer })
    }

    async fn load_relative(
        &self,
        channel_id: &ChannelId,
        anchor: Option<PostId>,
        direction: Direction,
        size: usize,
    ) -> FeedResult<LoadOutcome> {
        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => {
                let cursors = self.cursors(channel_id).await?;
                match direction {
                    Direction::Older => cursors.oldest,
                    Direction::Newer => cursors.newest,
                }
            }
        };
        let Some(anchor) = anchor else {
            debug!(
                channel_id = %channel_id,
                direction = direction.as_str(),
                "pagination: no anchor known, loading first page"
            );
            return self.load_first(channel_id).await;
        };

        let (state, merge_direction) = match direction {
            Direction::Older => (LoadState::LoadingOlder, MergeDirection::Older),
            Direction::Newer => (LoadState::LoadingNewer, MergeDirection::Newer),
        };
        self.run_load(
            channel_id,
            state,
            merge_direction,
            size,
            self.remote.fetch_page(channel_id, &anchor, direction, size),
        )
        .await
    }

    fn begin(&self, channel_id: &ChannelId, state: LoadState) -> Option<watch::Receiver<u64>> {
        let mut loads = self.loads();
        let load = loads
            .entry(channel_id.clone())
            .or_insert_with(ChannelLoad::new);
        if load.state != LoadState::Idle {
            return None;
        }
        load.state = state;
        Some(load.generation.subscribe())
    }

    fn remember_cursors(&self, channel_id: &ChannelId, cursors: &PageCursors) {
        let mut loads = self.loads();
        let load = loads
            .entry(channel_id.clone())
            .or_insert_with(ChannelLoad::new);
        load.cursors = Some(cursors.clone());
    }

    fn generation(&self, channel_id: &ChannelId) -> Option<u64> {
        self.loads()
            .get(channel_id)
            .map(|load| *load.generation.borrow())
    }

    async fn run_load<F>(
        &self,
        channel_id: &ChannelId,
        state: LoadState,
        direction: MergeDirection,
        requested: usize,
        fetch: F,
    ) -> FeedResult<LoadOutcome>
    where
        F: Future<Output = FeedResult<Page>> + Send,
    {
        let Some(mut generation_rx) = self.begin(channel_id, state) else {
            debug!(
                channel_id = %channel_id,
                state = self.state(channel_id).as_str(),
                "pagination: channel busy, skipping load"
            );
            return Ok(LoadOutcome::Skipped);
        };
        let generation = *generation_rx.borrow_and_update();
        let _guard = LoadGuard {
            controller: self,
            channel_id: channel_id.clone(),
            generation,
        };

        info!(
            channel_id = %channel_id,
            direction = direction.as_str(),
            generation,
            requested,
            "pagination: fetching page"
        );

        let result = tokio::select! {
            result = fetch => result,
            _ = generation_rx.wait_for(|current| *current != generation) => {
                info!(
                    channel_id = %channel_id,
                    direction = direction.as_str(),
                    generation,
                    "pagination: load cancelled before response"
                );
                return Ok(LoadOutcome::Cancelled);
            }
        };

        let (posts, is_last_page, received) = match result {
            Ok(page) => {
                let is_last = page.is_last_page();
                let received = page.returned_count;
                (page.posts, is_last, received)
            }
            Err(FeedError::NoMoreData) => (Vec::new(), true, 0),
            Err(err) => {
                warn!(
                    channel_id = %channel_id,
                    direction = direction.as_str(),
                    error = %err,
                    "pagination: fetch failed"
                );
                return Err(err);
            }
        };

        if self.generation(channel_id) != Some(generation) {
            info!(
                channel_id = %channel_id,
                direction = direction.as_str(),
                generation,
                "pagination: dropping response for stale generation"
            );
            return Ok(LoadOutcome::Cancelled);
        }

        let first = posts.iter().find(|post| post.confirmed_id().is_some()).cloned();
        let last = posts.iter().rev().find(|post| post.confirmed_id().is_some()).cloned();
        self.feed.merge(channel_id, posts, direction).await?;

        let mut cursors = self.cursors(channel_id).await?;
        match direction {
            MergeDirection::First => {
                cursors.oldest = first.as_ref().and_then(|post| post.confirmed_id().cloned());
                cursors.newest = last.as_ref().and_then(|post| post.confirmed_id().cloned());
                cursors.has_older = !is_last_page;
                cursors.has_newer = false;
            }
            MergeDirection::Older => {
                let (oldest, moved) = self
                    .outermost(channel_id, cursors.oldest.take(), first, Ordering::Less)
                    .await?;
                cursors.oldest = oldest;
                if moved || is_last_page {
                    cursors.has_older = !is_last_page;
                }
            }
            MergeDirection::Newer => {
                let (newest, moved) = self
                    .outermost(channel_id, cursors.newest.take(), last, Ordering::Greater)
                    .await?;
                cursors.newest = newest;
                if moved || is_last_page {
                    cursors.has_newer = !is_last_page;
                }
            }
            MergeDirection::Realtime | MergeDirection::Local => {}
        }
        self.feed
            .store()
            .save_cursors(channel_id, &cursors)
            .await
            .map_err(persistence)?;
        self.remember_cursors(channel_id, &cursors);

        Ok(LoadOutcome::Loaded(PageSummary {
            channel_id: channel_id.clone(),
            direction,
            received,
            is_last_page,
            cursors,
        }))
    }

    /// Cursor that reaches further out of `current` and `candidate`, where
    /// `outward` is the ordering of a post beyond the other. Cursors only move
    /// outward; the flag reports whether `candidate` took over.
    async fn outermost(
        &self,
        channel_id: &ChannelId,
        current: Option<PostId>,
        candidate: Option<Post>,
        outward: Ordering,
    ) -> FeedResult<(Option<PostId>, bool)> {
        let Some(candidate) = candidate else {
            return Ok((current, false));
        };
        let Some(current_id) = current else {
            return Ok((candidate.confirmed_id().cloned(), true));
        };
        let current_key = PostKey::Confirmed(current_id.clone());
        let snapshot = self.feed.snapshot(channel_id).await?;
        let current_post = match snapshot.post(&current_key) {
            Some(post) => Some(post.clone()),
            None => self
                .feed
                .store()
                .post(&current_key)
                .await
                .map_err(persistence)?,
        };
        match current_post {
            Some(post) if candidate.cmp_order(&post) != outward => {
                debug!(
                    channel_id = %channel_id,
                    cursor = %current_id,
                    "pagination: page lies inside loaded range, cursor kept"
                );
                Ok((Some(current_id), false))
            }
            _ => Ok((candidate.confirmed_id().cloned(), true)),
        }
    }

    /// Fills size and mime metadata for files referenced by the channel's
    /// posts. Failures are logged and left for the next pass.
    async fn backfill_file_info(&self, channel_id: &ChannelId) {
        let snapshot = match self.feed.snapshot(channel_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(channel_id = %channel_id, error = %err, "pagination: file info backfill skipped");
                return;
            }
        };
        let store = self.feed.store();
        for post in snapshot.posts.iter().filter(|post| !post.files.is_empty()) {
            for file_id in &post.files {
                let known = match store.file(file_id).await {
                    Ok(known) => known,
                    Err(err) => {
                        warn!(file_id = %file_id, error = %err, "pagination: file lookup failed");
                        continue;
                    }
                };
                if known.as_ref().is_some_and(|record| !record.needs_info()) {
                    continue;
                }
                let info = match self.remote.fetch_file_info(file_id).await {
                    Ok(info) => info,
                    Err(err) => {
                        warn!(file_id = %file_id, error = %err, "pagination: file info fetch failed");
                        continue;
                    }
                };
                let mut record = known.unwrap_or_else(|| {
                    FileRecord::remote(file_id.clone(), channel_id.clone(), post.key.clone())
                });
                record.name = Some(info.name);
                record.extension = info.extension;
                record.mime_type = info.mime_type;
                record.size_bytes = Some(info.size);
                if let Err(err) = store.upsert_file(&record).await {
                    warn!(file_id = %file_id, error = %err, "pagination: file info not stored");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
