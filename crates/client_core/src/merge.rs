use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, Utc};
use shared::domain::{PendingToken, Post, PostId, PostKey, PostKind, PostStatus};
use storage::PostBatch;

/// Maximum gap, in seconds, between two posts by the same author for the
/// later one to render as a follow-up.
pub const FOLLOW_UP_WINDOW_SECS: i64 = 5 * 60;

/// Where a batch of incoming posts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeDirection {
    First,
    Older,
    Newer,
    Realtime,
    Local,
}

impl MergeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeDirection::First => "first",
            MergeDirection::Older => "older",
            MergeDirection::Newer => "newer",
            MergeDirection::Realtime => "realtime",
            MergeDirection::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenState {
    Pending,
    Resolved(PostId),
}

/// Result of merging one batch into a channel's ordered post sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Live posts of the channel in feed order after the merge.
    pub snapshot: Vec<Post>,
    /// Keys inserted, updated or whose kind flipped. All present in `snapshot`.
    pub changed: Vec<PostKey>,
    /// Keys that left the ordering: superseded pending posts and deletions.
    pub removed: Vec<PostKey>,
    /// Deleted posts to persist as tombstones.
    pub tombstones: Vec<Post>,
    /// Tokens whose pending post was replaced by its confirmed counterpart.
    pub retired: Vec<(PendingToken, PostId)>,
    /// Pending tokens introduced by this batch.
    pub registered: Vec<PendingToken>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.tombstones.is_empty()
    }

    /// Storage mutation that makes the local store match this outcome.
    pub fn batch(&self) -> PostBatch {
        let changed: HashSet<&PostKey> = self.changed.iter().collect();
        let mut upserts: Vec<Post> = self
            .snapshot
            .iter()
            .filter(|post| changed.contains(&post.key))
            .cloned()
            .collect();
        upserts.extend(self.tombstones.iter().cloned());
        PostBatch {
            upserts,
            removals: self
                .removed
                .iter()
                .filter(|key| key.is_pending())
                .cloned()
                .collect(),
        }
    }
}

/// Pure merge of post batches plus the per-channel bookkeeping it depends on:
/// the pending-token correlation map and the deletion time of every key that
/// left the ordering as a tombstone.
///
/// `merge` never mutates the engine; callers apply the token bookkeeping with
/// `commit` once the outcome has been persisted, so a failed write leaves the
/// map untouched.
#[derive(Debug, Default)]
pub struct MergeEngine {
    tokens: HashMap<PendingToken, TokenState>,
    deleted: HashMap<PostKey, DateTime<Utc>>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pending(&mut self, token: PendingToken) {
        self.tokens.entry(token).or_insert(TokenState::Pending);
    }

    /// Marks `token` as resolved to `post_id`. Returns `false` when the token
    /// was already retired.
    pub fn retire(&mut self, token: &PendingToken, post_id: PostId) -> bool {
        match self.tokens.get_mut(token) {
            Some(TokenState::Resolved(_)) => false,
            Some(state) => {
                *state = TokenState::Resolved(post_id);
                true
            }
            None => {
                self.tokens
                    .insert(token.clone(), TokenState::Resolved(post_id));
                true
            }
        }
    }

    pub fn resolved(&self, token: &PendingToken) -> Option<&PostId> {
        match self.tokens.get(token) {
            Some(TokenState::Resolved(id)) => Some(id),
            _ => None,
        }
    }

    pub fn is_pending(&self, token: &PendingToken) -> bool {
        matches!(self.tokens.get(token), Some(TokenState::Pending))
    }

    /// Remembers that `key` was deleted as of `at`; copies updated at or
    /// before that instant are dropped by later merges.
    pub fn record_deleted(&mut self, key: PostKey, at: DateTime<Utc>) {
        let entry = self.deleted.entry(key).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn deleted_at(&self, key: &PostKey) -> Option<DateTime<Utc>> {
        self.deleted.get(key).copied()
    }

    pub fn commit(&mut self, outcome: &MergeOutcome) {
        for token in &outcome.registered {
            self.register_pending(token.clone());
        }
        for (token, post_id) in &outcome.retired {
            self.retire(token, post_id.clone());
        }
        for post in &outcome.tombstones {
            self.record_deleted(post.key.clone(), post.updated_at);
        }
    }

    pub fn merge(
        &self,
        existing: &[Post],
        incoming: Vec<Post>,
        _direction: MergeDirection,
    ) -> MergeOutcome {
        let incoming = dedupe_incoming(incoming);

        let mut by_key: HashMap<&PostKey, usize> = HashMap::with_capacity(existing.len());
        let mut pending_by_token: HashMap<&PendingToken, usize> = HashMap::new();
        for (idx, post) in existing.iter().enumerate() {
            by_key.insert(&post.key, idx);
            if let PostKey::Pending(token) = &post.key {
                pending_by_token.insert(token, idx);
            }
        }

        let mut outcome = MergeOutcome::default();
        let mut dropped: HashSet<usize> = HashSet::new();
        let mut inserts: Vec<Post> = Vec::new();

        for mut post in incoming {
            if self
                .deleted_at(&post.key)
                .is_some_and(|deleted_at| post.updated_at <= deleted_at)
            {
                continue;
            }

            if let PostKey::Pending(token) = &post.key {
                if !self.tokens.contains_key(token) {
                    outcome.registered.push(token.clone());
                }
            }

            let correlation = match (&post.key, &post.pending_token) {
                (PostKey::Confirmed(id), Some(token)) => Some((id.clone(), token.clone())),
                _ => None,
            };
            if let Some((id, token)) = correlation {
                if let Some(&idx) = pending_by_token.get(&token) {
                    if dropped.insert(idx) {
                        let pending = &existing[idx];
                        if post.files.is_empty() && !pending.files.is_empty() {
                            post.files = pending.files.clone();
                        }
                        outcome.removed.push(pending.key.clone());
                        if self.resolved(&token).is_none() {
                            outcome.retired.push((token, id));
                        }
                    }
                }
            }

            let deleted = !post.is_live();
            match by_key.get(&post.key) {
                Some(&idx) => {
                    let current = &existing[idx];
                    if deleted {
                        if post.updated_at >= current.updated_at && dropped.insert(idx) {
                            outcome.removed.push(post.key.clone());
                            outcome.tombstones.push(tombstone(post));
                        }
                    } else if post.updated_at > current.updated_at && dropped.insert(idx) {
                        post.kind = current.kind;
                        outcome.changed.push(post.key.clone());
                        inserts.push(post);
                    }
                }
                None if deleted => outcome.tombstones.push(tombstone(post)),
                None => {
                    outcome.changed.push(post.key.clone());
                    inserts.push(post);
                }
            }
        }

        inserts.sort_by(Post::cmp_order);
        let untouched = existing
            .iter()
            .enumerate()
            .filter(|(idx, _)| !dropped.contains(idx))
            .map(|(_, post)| post.clone());
        let mut snapshot = merge_sorted(untouched, inserts, existing.len());

        let already_changed: HashSet<PostKey> = outcome.changed.iter().cloned().collect();
        for key in resolve_kinds(&mut snapshot) {
            if !already_changed.contains(&key) {
                outcome.changed.push(key);
            }
        }

        outcome.snapshot = snapshot;
        outcome
    }
}

/// In-page duplicates collapse to the copy with the highest `updated_at`;
/// ties keep the first occurrence.
fn dedupe_incoming(incoming: Vec<Post>) -> Vec<Post> {
    let mut seen: HashMap<PostKey, usize> = HashMap::with_capacity(incoming.len());
    let mut out: Vec<Post> = Vec::with_capacity(incoming.len());
    for post in incoming {
        match seen.get(&post.key) {
            Some(&idx) => {
                if post.updated_at > out[idx].updated_at {
                    out[idx] = post;
                }
            }
            None => {
                seen.insert(post.key.clone(), out.len());
                out.push(post);
            }
        }
    }
    out
}

fn tombstone(mut post: Post) -> Post {
    post.status = PostStatus::Deleted;
    if post.deleted_at.is_none() {
        post.deleted_at = Some(post.updated_at);
    }
    post
}

fn merge_sorted(
    untouched: impl Iterator<Item = Post>,
    inserts: Vec<Post>,
    capacity: usize,
) -> Vec<Post> {
    let mut out = Vec::with_capacity(capacity + inserts.len());
    let mut left = untouched.peekable();
    let mut right = inserts.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l.cmp_order(r).is_le(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        out.extend(next);
    }
    out
}

/// Assigns every post its presentation kind and returns the keys whose kind
/// changed.
pub fn resolve_kinds(posts: &mut [Post]) -> Vec<PostKey> {
    let mut flipped = Vec::new();
    for idx in 0..posts.len() {
        let kind = if !posts[idx].files.is_empty() {
            PostKind::Attachment
        } else if idx > 0 && is_follow_up(&posts[idx - 1], &posts[idx]) {
            PostKind::FollowUp
        } else {
            PostKind::Common
        };
        if posts[idx].kind != kind {
            posts[idx].kind = kind;
            flipped.push(posts[idx].key.clone());
        }
    }
    flipped
}

fn is_follow_up(previous: &Post, post: &Post) -> bool {
    previous.author_id == post.author_id
        && previous.root_id == post.root_id
        && post.created_at - previous.created_at <= Duration::seconds(FOLLOW_UP_WINDOW_SECS)
        && previous.created_at.num_days_from_ce() == post.created_at.num_days_from_ce()
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
