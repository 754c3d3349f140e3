use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Channel, ChannelId, FileId, FileRecord, PageCursors, PendingToken, Post, PostId, PostKey,
        UserId,
    },
    protocol::millis_to_datetime,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Atomic unit of post mutation produced by one merge.
#[derive(Debug, Clone, Default)]
pub struct PostBatch {
    /// Posts to insert or overwrite, tombstones included.
    pub upserts: Vec<Post>,
    /// Keys to drop entirely (pending posts superseded by their confirmed copy).
    pub removals: Vec<PostKey>,
}

impl PostBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Persistent keyed store of posts, channels and files.
#[async_trait]
pub trait LocalMessageStore: Send + Sync {
    async fn post(&self, key: &PostKey) -> Result<Option<Post>>;
    /// Live (non-deleted) posts of a channel in feed order.
    async fn posts_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<Post>>;
    /// Deleted posts of a channel, kept so stale copies cannot revive them.
    async fn tombstones_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<Post>>;
    /// Applies every upsert and removal in one transaction. An upsert never
    /// replaces a row updated later, and a live copy never replaces a tombstone
    /// carrying the same update time.
    async fn apply_batch(&self, batch: &PostBatch) -> Result<()>;
    async fn channel(&self, channel_id: &ChannelId) -> Result<Option<Channel>>;
    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;
    async fn save_cursors(&self, channel_id: &ChannelId, cursors: &PageCursors) -> Result<()>;
    async fn set_last_viewed(&self, channel_id: &ChannelId, at: DateTime<Utc>) -> Result<()>;
    async fn upsert_file(&self, file: &FileRecord) -> Result<()>;
    async fn file(&self, file_id: &FileId) -> Result<Option<FileRecord>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn files_for_post(&self, key: &PostKey) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, post_key, state, name, extension, mime_type, size_bytes
             FROM files
             WHERE post_key = ?
             ORDER BY id ASC",
        )
        .bind(key.storage_key())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, display_name, last_viewed_at, message_count, members_json,
                    oldest_post_id, newest_post_id, has_older, has_newer
             FROM channels
             ORDER BY lower(display_name) ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }
}

#[async_trait]
impl LocalMessageStore for Storage {
    async fn post(&self, key: &PostKey) -> Result<Option<Post>> {
        let row = sqlx::query(
            "SELECT post_key, pending_token, channel_id, author_id, root_id, created_at_ms,
                    updated_at_ms, deleted_at_ms, body, status, kind, file_ids_json
             FROM posts
             WHERE post_key = ?",
        )
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn posts_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT post_key, pending_token, channel_id, author_id, root_id, created_at_ms,
                    updated_at_ms, deleted_at_ms, body, status, kind, file_ids_json
             FROM posts
             WHERE channel_id = ? AND status != 'deleted' AND deleted_at_ms IS NULL
             ORDER BY created_at_ms ASC, post_key ASC",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut posts = rows.iter().map(post_from_row).collect::<Result<Vec<_>>>()?;
        // SQL orders storage keys as text; the feed orders pending before confirmed.
        posts.sort_by(Post::cmp_order);
        Ok(posts)
    }

    async fn tombstones_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT post_key, pending_token, channel_id, author_id, root_id, created_at_ms,
                    updated_at_ms, deleted_at_ms, body, status, kind, file_ids_json
             FROM posts
             WHERE channel_id = ? AND (status = 'deleted' OR deleted_at_ms IS NOT NULL)",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn apply_batch(&self, batch: &PostBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for key in &batch.removals {
            sqlx::query("DELETE FROM posts WHERE post_key = ?")
                .bind(key.storage_key())
                .execute(&mut *tx)
                .await?;
        }

        for post in &batch.upserts {
            let file_ids_json =
                serde_json::to_string(&post.files).context("failed to encode post file ids")?;
            sqlx::query(
                "INSERT INTO posts (post_key, pending_token, channel_id, author_id, root_id,
                                    created_at_ms, updated_at_ms, deleted_at_ms, body, status,
                                    kind, file_ids_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(post_key) DO UPDATE SET
                    pending_token = excluded.pending_token,
                    channel_id = excluded.channel_id,
                    author_id = excluded.author_id,
                    root_id = excluded.root_id,
                    created_at_ms = excluded.created_at_ms,
                    updated_at_ms = excluded.updated_at_ms,
                    deleted_at_ms = excluded.deleted_at_ms,
                    body = excluded.body,
                    status = excluded.status,
                    kind = excluded.kind,
                    file_ids_json = excluded.file_ids_json
                 WHERE excluded.updated_at_ms > posts.updated_at_ms
                    OR (excluded.updated_at_ms = posts.updated_at_ms
                        AND (excluded.status = 'deleted' OR posts.status != 'deleted'))",
            )
            .bind(post.key.storage_key())
            .bind(post.pending_token.as_ref().map(|t| t.as_str()))
            .bind(post.channel_id.as_str())
            .bind(post.author_id.as_str())
            .bind(post.root_id.as_ref().map(|r| r.as_str()))
            .bind(post.created_at.timestamp_millis())
            .bind(post.updated_at.timestamp_millis())
            .bind(post.deleted_at.map(|at| at.timestamp_millis()))
            .bind(&post.body)
            .bind(post.status.as_str())
            .bind(post.kind.as_str())
            .bind(file_ids_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert post {}", post.key))?;
        }

        tx.commit().await?;
        debug!(
            upserts = batch.upserts.len(),
            removals = batch.removals.len(),
            "storage: applied post batch"
        );
        Ok(())
    }

    async fn channel(&self, channel_id: &ChannelId) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, display_name, last_viewed_at, message_count, members_json,
                    oldest_post_id, newest_post_id, has_older, has_newer
             FROM channels
             WHERE id = ?",
        )
        .bind(channel_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let members_json =
            serde_json::to_string(&channel.members).context("failed to encode channel members")?;
        sqlx::query(
            "INSERT INTO channels (id, display_name, last_viewed_at, message_count, members_json,
                                   oldest_post_id, newest_post_id, has_older, has_newer)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                last_viewed_at = excluded.last_viewed_at,
                message_count = excluded.message_count,
                members_json = excluded.members_json,
                oldest_post_id = excluded.oldest_post_id,
                newest_post_id = excluded.newest_post_id,
                has_older = excluded.has_older,
                has_newer = excluded.has_newer",
        )
        .bind(channel.id.as_str())
        .bind(&channel.display_name)
        .bind(channel.last_viewed_at.map(|at| at.timestamp_millis()))
        .bind(i64::try_from(channel.message_count).unwrap_or(i64::MAX))
        .bind(members_json)
        .bind(channel.cursors.oldest.as_ref().map(|id| id.as_str()))
        .bind(channel.cursors.newest.as_ref().map(|id| id.as_str()))
        .bind(channel.cursors.has_older)
        .bind(channel.cursors.has_newer)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_cursors(&self, channel_id: &ChannelId, cursors: &PageCursors) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, oldest_post_id, newest_post_id, has_older, has_newer)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                oldest_post_id = excluded.oldest_post_id,
                newest_post_id = excluded.newest_post_id,
                has_older = excluded.has_older,
                has_newer = excluded.has_newer",
        )
        .bind(channel_id.as_str())
        .bind(cursors.oldest.as_ref().map(|id| id.as_str()))
        .bind(cursors.newest.as_ref().map(|id| id.as_str()))
        .bind(cursors.has_older)
        .bind(cursors.has_newer)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist cursors for channel {channel_id}"))?;
        Ok(())
    }

    async fn set_last_viewed(&self, channel_id: &ChannelId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, last_viewed_at) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET last_viewed_at = excluded.last_viewed_at",
        )
        .bind(channel_id.as_str())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO files (id, channel_id, post_key, state, name, extension, mime_type, size_bytes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                post_key = COALESCE(excluded.post_key, files.post_key),
                state = excluded.state,
                name = COALESCE(excluded.name, files.name),
                extension = COALESCE(excluded.extension, files.extension),
                mime_type = COALESCE(excluded.mime_type, files.mime_type),
                size_bytes = COALESCE(excluded.size_bytes, files.size_bytes)",
        )
        .bind(file.id.as_str())
        .bind(file.channel_id.as_str())
        .bind(file.post_key.as_ref().map(PostKey::storage_key))
        .bind(file.state.as_str())
        .bind(file.name.as_deref())
        .bind(file.extension.as_deref())
        .bind(file.mime_type.as_deref())
        .bind(file.size_bytes.map(|size| i64::try_from(size).unwrap_or(i64::MAX)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn file(&self, file_id: &FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, channel_id, post_key, state, name, extension, mime_type, size_bytes
             FROM files
             WHERE id = ?",
        )
        .bind(file_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }
}

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let raw_key: String = r.get("post_key");
    let key = PostKey::from_str(&raw_key).with_context(|| format!("bad post key '{raw_key}'"))?;
    let status = r.get::<String, _>("status").parse()?;
    let kind = r.get::<String, _>("kind").parse()?;
    let files = serde_json::from_str(&r.get::<String, _>("file_ids_json"))
        .with_context(|| format!("bad file id list for post {raw_key}"))?;

    Ok(Post {
        key,
        pending_token: r.get::<Option<String>, _>("pending_token").map(PendingToken),
        channel_id: ChannelId(r.get("channel_id")),
        author_id: UserId(r.get("author_id")),
        root_id: r.get::<Option<String>, _>("root_id").map(PostId),
        created_at: millis_to_datetime(r.get("created_at_ms")),
        updated_at: millis_to_datetime(r.get("updated_at_ms")),
        deleted_at: r.get::<Option<i64>, _>("deleted_at_ms").map(millis_to_datetime),
        body: r.get("body"),
        status,
        files,
        kind,
    })
}

fn channel_from_row(r: &SqliteRow) -> Result<Channel> {
    let members = serde_json::from_str(&r.get::<String, _>("members_json"))
        .context("bad channel member list")?;
    Ok(Channel {
        id: ChannelId(r.get("id")),
        display_name: r.get("display_name"),
        last_viewed_at: r.get::<Option<i64>, _>("last_viewed_at").map(millis_to_datetime),
        message_count: r.get::<i64, _>("message_count").max(0) as u64,
        members,
        cursors: PageCursors {
            oldest: r.get::<Option<String>, _>("oldest_post_id").map(PostId),
            newest: r.get::<Option<String>, _>("newest_post_id").map(PostId),
            has_older: r.get::<bool, _>("has_older"),
            has_newer: r.get::<bool, _>("has_newer"),
        },
    })
}

fn file_from_row(r: &SqliteRow) -> Result<FileRecord> {
    let post_key = r
        .get::<Option<String>, _>("post_key")
        .map(|raw| PostKey::from_str(&raw))
        .transpose()?;
    Ok(FileRecord {
        id: FileId(r.get("id")),
        channel_id: ChannelId(r.get("channel_id")),
        post_key,
        state: r.get::<String, _>("state").parse()?,
        name: r.get("name"),
        extension: r.get("extension"),
        mime_type: r.get("mime_type"),
        size_bytes: r.get::<Option<i64>, _>("size_bytes").map(|size| size.max(0) as u64),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
