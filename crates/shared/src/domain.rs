use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(PostId);
id_newtype!(FileId);
id_newtype!(PendingToken);

impl PendingToken {
    /// Fresh client-side correlation token for one user-initiated send.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

const PENDING_KEY_PREFIX: &str = "pending:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("post key must not be empty")]
    Empty,
    #[error("unknown post status '{0}'")]
    UnknownStatus(String),
    #[error("unknown post kind '{0}'")]
    UnknownKind(String),
    #[error("unknown file state '{0}'")]
    UnknownFileState(String),
}

/// Identity of a post inside a channel feed.
///
/// A logical message is either still pending (identified by the client's
/// correlation token) or confirmed by the server; never both at once.
/// `Pending` keys order before `Confirmed` keys when creation times tie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PostKey {
    Pending(PendingToken),
    Confirmed(PostId),
}

impl PostKey {
    pub fn is_pending(&self) -> bool {
        matches!(self, PostKey::Pending(_))
    }

    pub fn confirmed_id(&self) -> Option<&PostId> {
        match self {
            PostKey::Confirmed(id) => Some(id),
            PostKey::Pending(_) => None,
        }
    }

    /// Flat string form used as the storage primary key.
    pub fn storage_key(&self) -> String {
        match self {
            PostKey::Pending(token) => format!("{PENDING_KEY_PREFIX}{}", token.0),
            PostKey::Confirmed(id) => id.0.clone(),
        }
    }
}

impl FromStr for PostKey {
    type Err = KeyParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() {
            return Err(KeyParseError::Empty);
        }
        Ok(match raw.strip_prefix(PENDING_KEY_PREFIX) {
            Some(token) if !token.is_empty() => PostKey::Pending(PendingToken::new(token)),
            Some(_) => return Err(KeyParseError::Empty),
            None => PostKey::Confirmed(PostId::new(raw)),
        })
    }
}

impl fmt::Display for PostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

impl From<PostId> for PostKey {
    fn from(value: PostId) -> Self {
        PostKey::Confirmed(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Pending,
    Sent,
    Failed,
    Deleted,
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Sent => "sent",
            PostStatus::Failed => "failed",
            PostStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for PostStatus {
    type Err = KeyParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(PostStatus::Pending),
            "sent" => Ok(PostStatus::Sent),
            "failed" => Ok(PostStatus::Failed),
            "deleted" => Ok(PostStatus::Deleted),
            other => Err(KeyParseError::UnknownStatus(other.to_string())),
        }
    }
}

/// Presentation variant of a post, resolved once when the post is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    #[default]
    Common,
    Attachment,
    FollowUp,
}

impl PostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PostKind::Common => "common",
            PostKind::Attachment => "attachment",
            PostKind::FollowUp => "follow_up",
        }
    }
}

impl FromStr for PostKind {
    type Err = KeyParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "common" => Ok(PostKind::Common),
            "attachment" => Ok(PostKind::Attachment),
            "follow_up" => Ok(PostKind::FollowUp),
            other => Err(KeyParseError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub key: PostKey,
    /// Correlation token of the send that produced this post. Confirmed posts
    /// carry the token echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_token: Option<PendingToken>,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<PostId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub body: String,
    pub status: PostStatus,
    #[serde(default)]
    pub files: Vec<FileId>,
    #[serde(default)]
    pub kind: PostKind,
}

impl Post {
    /// Locally composed post that has not reached the server yet.
    pub fn pending(
        token: PendingToken,
        channel_id: ChannelId,
        author_id: UserId,
        body: impl Into<String>,
        files: Vec<FileId>,
        root_id: Option<PostId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: PostKey::Pending(token.clone()),
            pending_token: Some(token),
            channel_id,
            author_id,
            root_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            body: body.into(),
            status: PostStatus::Pending,
            files,
            kind: PostKind::Common,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != PostStatus::Deleted && self.deleted_at.is_none()
    }

    pub fn confirmed_id(&self) -> Option<&PostId> {
        self.key.confirmed_id()
    }

    /// Total ordering inside a channel: creation time, then key.
    pub fn cmp_order(&self, other: &Post) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Pagination cursors and exhaustion flags for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursors {
    pub oldest: Option<PostId>,
    pub newest: Option<PostId>,
    pub has_older: bool,
    pub has_newer: bool,
}

impl Default for PageCursors {
    fn default() -> Self {
        Self {
            oldest: None,
            newest: None,
            has_older: true,
            has_newer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub display_name: String,
    pub last_viewed_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub members: Vec<UserId>,
    pub cursors: PageCursors,
}

impl Channel {
    pub fn new(id: ChannelId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            last_viewed_at: None,
            message_count: 0,
            members: Vec::new(),
            cursors: PageCursors::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferState {
    /// Known from a fetched post, bytes live on the server.
    Remote,
    Uploading,
    Uploaded,
    Failed,
}

impl FileTransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileTransferState::Remote => "remote",
            FileTransferState::Uploading => "uploading",
            FileTransferState::Uploaded => "uploaded",
            FileTransferState::Failed => "failed",
        }
    }
}

impl FromStr for FileTransferState {
    type Err = KeyParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "remote" => Ok(FileTransferState::Remote),
            "uploading" => Ok(FileTransferState::Uploading),
            "uploaded" => Ok(FileTransferState::Uploaded),
            "failed" => Ok(FileTransferState::Failed),
            other => Err(KeyParseError::UnknownFileState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub channel_id: ChannelId,
    pub post_key: Option<PostKey>,
    pub state: FileTransferState,
    pub name: Option<String>,
    pub extension: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

impl FileRecord {
    pub fn remote(id: FileId, channel_id: ChannelId, post_key: PostKey) -> Self {
        Self {
            id,
            channel_id,
            post_key: Some(post_key),
            state: FileTransferState::Remote,
            name: None,
            extension: None,
            mime_type: None,
            size_bytes: None,
        }
    }

    /// Size/mime metadata is filled lazily after the merge that introduced the file.
    pub fn needs_info(&self) -> bool {
        self.size_bytes.is_none() || self.mime_type.is_none()
    }
}
