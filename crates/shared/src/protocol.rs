use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChannelId, FileId, PendingToken, Post, PostId, PostKey, PostKind, PostStatus, UserId,
};

/// Server representation of a post. Timestamps are milliseconds since the
/// Unix epoch; `delete_at == 0` means the post is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPayload {
    pub id: PostId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub create_at: i64,
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<PostId>,
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_post_id: Option<PendingToken>,
}

impl PostPayload {
    pub fn into_post(self) -> Post {
        let deleted_at = (self.delete_at > 0).then(|| millis_to_datetime(self.delete_at));
        Post {
            key: PostKey::Confirmed(self.id),
            pending_token: self.pending_post_id,
            channel_id: self.channel_id,
            author_id: self.user_id,
            root_id: self.root_id.filter(|root| !root.0.is_empty()),
            created_at: millis_to_datetime(self.create_at),
            updated_at: millis_to_datetime(self.update_at),
            status: if deleted_at.is_some() {
                PostStatus::Deleted
            } else {
                PostStatus::Sent
            },
            deleted_at,
            body: self.message,
            files: self.file_ids,
            kind: PostKind::Common,
        }
    }

    /// Wire form of a confirmed post; pending posts have no server identity.
    pub fn from_post(post: &Post) -> Option<Self> {
        let id = post.confirmed_id()?.clone();
        Some(Self {
            id,
            channel_id: post.channel_id.clone(),
            user_id: post.author_id.clone(),
            create_at: post.created_at.timestamp_millis(),
            update_at: post.updated_at.timestamp_millis(),
            delete_at: post.deleted_at.map(|at| at.timestamp_millis()).unwrap_or(0),
            root_id: post.root_id.clone(),
            message: post.body.clone(),
            file_ids: post.files.clone(),
            pending_post_id: post.pending_token.clone(),
        })
    }
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Post collection as returned by list and search endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostListResponse {
    #[serde(default)]
    pub order: Vec<PostId>,
    #[serde(default)]
    pub posts: HashMap<PostId, PostPayload>,
}

impl PostListResponse {
    /// Number of posts the server actually returned for the page.
    pub fn returned_count(&self) -> usize {
        self.order.len().max(self.posts.len())
    }

    /// Posts in `order` sequence; ids missing from the map are skipped, and
    /// posts absent from `order` are appended.
    pub fn into_posts(mut self) -> Vec<Post> {
        let mut posts = Vec::with_capacity(self.posts.len());
        for id in &self.order {
            if let Some(payload) = self.posts.remove(id) {
                posts.push(payload.into_post());
            }
        }
        posts.extend(self.posts.into_values().map(PostPayload::into_post));
        posts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePostRequest {
    pub channel_id: ChannelId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<PostId>,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    pub pending_post_id: PendingToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePostRequest {
    pub id: PostId,
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPostsRequest {
    pub terms: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoPayload {
    pub id: FileId,
    #[serde(default)]
    pub post_id: Option<PostId>,
    pub name: String,
    #[serde(default)]
    pub extension: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Out-of-band event pushed over the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    pub channel_id: ChannelId,
    #[serde(flatten)]
    pub event: RealtimeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewPost {
        post: PostPayload,
    },
    EditPost {
        post: PostPayload,
    },
    DeletePost {
        post: PostPayload,
    },
    Typing {
        user_id: UserId,
        #[serde(default)]
        stopped: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str, create_at: i64) -> PostPayload {
        PostPayload {
            id: PostId::new(id),
            channel_id: ChannelId::new("c1"),
            user_id: UserId::new("u1"),
            create_at,
            update_at: create_at,
            delete_at: 0,
            root_id: None,
            message: format!("body {id}"),
            file_ids: Vec::new(),
            pending_post_id: None,
        }
    }

    #[test]
    fn deleted_payload_becomes_deleted_post() {
        let mut raw = payload("p1", 1_000);
        raw.delete_at = 2_000;
        let post = raw.into_post();
        assert_eq!(post.status, PostStatus::Deleted);
        assert_eq!(post.deleted_at, Some(millis_to_datetime(2_000)));
        assert!(!post.is_live());
    }

    #[test]
    fn empty_root_id_is_treated_as_absent() {
        let mut raw = payload("p1", 1_000);
        raw.root_id = Some(PostId::new(""));
        assert_eq!(raw.into_post().root_id, None);
    }

    #[test]
    fn list_response_follows_order_and_keeps_strays() {
        let mut response = PostListResponse::default();
        response.order = vec![PostId::new("b"), PostId::new("missing"), PostId::new("a")];
        response.posts.insert(PostId::new("a"), payload("a", 1));
        response.posts.insert(PostId::new("b"), payload("b", 2));
        response.posts.insert(PostId::new("c"), payload("c", 3));

        assert_eq!(response.returned_count(), 3);
        let keys: Vec<_> = response.into_posts().into_iter().map(|p| p.key).collect();
        assert_eq!(
            keys,
            vec![
                PostKey::Confirmed(PostId::new("b")),
                PostKey::Confirmed(PostId::new("a")),
                PostKey::Confirmed(PostId::new("c")),
            ]
        );
    }

    #[test]
    fn realtime_envelope_uses_flat_type_channel_payload_shape() {
        let raw = serde_json::json!({
            "type": "typing",
            "channel_id": "c1",
            "payload": { "user_id": "u9" }
        });
        let envelope: RealtimeEnvelope = serde_json::from_value(raw).expect("envelope");
        assert_eq!(envelope.channel_id, ChannelId::new("c1"));
        assert_eq!(
            envelope.event,
            RealtimeEvent::Typing {
                user_id: UserId::new("u9"),
                stopped: false
            }
        );
    }
}
