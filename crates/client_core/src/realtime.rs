use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::{ChannelId, Post, PostStatus, UserId},
    protocol::{RealtimeEnvelope, RealtimeEvent},
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{FeedError, FeedResult},
    feed::{FeedEvent, FeedState},
    merge::MergeDirection,
};

/// Who is typing where. Ephemeral, never persisted.
#[derive(Debug)]
pub struct TypingRoster {
    own_user: UserId,
    typing: HashMap<ChannelId, BTreeSet<UserId>>,
}

impl TypingRoster {
    pub fn new(own_user: UserId) -> Self {
        Self {
            own_user,
            typing: HashMap::new(),
        }
    }

    /// Records a typing start or stop. Returns the channel's new roster when
    /// it changed.
    pub fn apply(&mut self, channel_id: &ChannelId, user_id: &UserId, stopped: bool) -> Option<Vec<UserId>> {
        if user_id == &self.own_user {
            return None;
        }
        let users = self.typing.entry(channel_id.clone()).or_default();
        let changed = if stopped {
            users.remove(user_id)
        } else {
            users.insert(user_id.clone())
        };
        changed.then(|| users.iter().cloned().collect())
    }

    pub fn typing(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.typing
            .get(channel_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// How long a channel worker waits for another event before retiring.
pub const CHANNEL_WORKER_IDLE: Duration = Duration::from_secs(60);

type ChannelQueues = Arc<Mutex<HashMap<ChannelId, mpsc::UnboundedSender<RealtimeEvent>>>>;

fn lock_queues(
    queues: &Mutex<HashMap<ChannelId, mpsc::UnboundedSender<RealtimeEvent>>>,
) -> MutexGuard<'_, HashMap<ChannelId, mpsc::UnboundedSender<RealtimeEvent>>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans realtime events out to one FIFO worker per channel. Workers retire
/// after `idle_timeout` without events and are respawned on demand.
pub struct RealtimeEventRouter {
    feed: Arc<FeedState>,
    queues: ChannelQueues,
    roster: Mutex<TypingRoster>,
    idle_timeout: Duration,
}

impl RealtimeEventRouter {
    pub fn new(feed: Arc<FeedState>, own_user: UserId) -> Self {
        Self {
            feed,
            queues: Arc::new(Mutex::new(HashMap::new())),
            roster: Mutex::new(TypingRoster::new(own_user)),
            idle_timeout: CHANNEL_WORKER_IDLE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of channels that currently have a worker.
    pub fn active_workers(&self) -> usize {
        lock_queues(&self.queues).len()
    }

    fn roster(&self) -> MutexGuard<'_, TypingRoster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn typing_users(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.roster().typing(channel_id)
    }

    /// Dispatches one envelope. Must be called from within a tokio runtime.
    pub fn route(&self, envelope: RealtimeEnvelope) {
        let RealtimeEnvelope { channel_id, event } = envelope;
        match event {
            RealtimeEvent::Typing { user_id, stopped } => {
                self.update_typing(&channel_id, &user_id, stopped);
            }
            event => {
                if let RealtimeEvent::NewPost { post } = &event {
                    self.update_typing(&channel_id, &post.user_id, true);
                }
                self.enqueue(channel_id, event);
            }
        }
    }

    fn update_typing(&self, channel_id: &ChannelId, user_id: &UserId, stopped: bool) {
        let changed = self.roster().apply(channel_id, user_id, stopped);
        if let Some(typing) = changed {
            self.feed.emit(FeedEvent::TypingChanged {
                channel_id: channel_id.clone(),
                typing,
            });
        }
    }

    fn enqueue(&self, channel_id: ChannelId, event: RealtimeEvent) {
        let mut queues = lock_queues(&self.queues);
        let event = match queues.get(&channel_id) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel_worker(
            Arc::clone(&self.feed),
            Arc::clone(&self.queues),
            channel_id.clone(),
            rx,
            self.idle_timeout,
        ));
        if tx.send(event).is_err() {
            warn!(channel_id = %channel_id, "realtime: channel worker exited immediately");
        }
        queues.insert(channel_id, tx);
    }
}

async fn run_channel_worker(
    feed: Arc<FeedState>,
    queues: ChannelQueues,
    channel_id: ChannelId,
    mut events: mpsc::UnboundedReceiver<RealtimeEvent>,
    idle_timeout: Duration,
) {
    debug!(channel_id = %channel_id, "realtime: channel worker started");
    loop {
        let event = match timeout(idle_timeout, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                // Senders only push while holding the map lock, so an empty
                // queue seen under the lock stays empty once the entry is gone.
                let mut queues = lock_queues(&queues);
                match events.try_recv() {
                    Ok(event) => event,
                    Err(_) => {
                        queues.remove(&channel_id);
                        debug!(channel_id = %channel_id, "realtime: channel worker retired while idle");
                        break;
                    }
                }
            }
        };
        apply_event(&feed, &channel_id, event).await;
    }
    debug!(channel_id = %channel_id, "realtime: channel worker stopped");
}

async fn apply_event(feed: &FeedState, channel_id: &ChannelId, event: RealtimeEvent) {
    let Some(post) = event_post(event) else {
        return;
    };
    if &post.channel_id != channel_id {
        warn!(
            channel_id = %channel_id,
            post_channel_id = %post.channel_id,
            "realtime: dropping post routed to the wrong channel"
        );
        return;
    }
    if let Err(err) = feed
        .merge(channel_id, vec![post], MergeDirection::Realtime)
        .await
    {
        warn!(channel_id = %channel_id, error = %err, "realtime: merge failed");
    }
}

/// One-post page for a post event; typing events carry no post.
fn event_post(event: RealtimeEvent) -> Option<Post> {
    match event {
        RealtimeEvent::NewPost { post } | RealtimeEvent::EditPost { post } => Some(post.into_post()),
        RealtimeEvent::DeletePost { post } => {
            let mut post = post.into_post();
            post.status = PostStatus::Deleted;
            if post.deleted_at.is_none() {
                post.deleted_at = Some(post.updated_at);
            }
            Some(post)
        }
        RealtimeEvent::Typing { .. } => None,
    }
}

/// Websocket endpoint for a server base URL.
pub fn websocket_url(server_url: &str) -> FeedResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| FeedError::Config(format!("invalid server url '{server_url}': {err}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(FeedError::Config(format!(
                "server url must be http(s), got '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| FeedError::Config(format!("cannot derive websocket url from '{server_url}'")))?;
    let path = format!("{}/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Connects to the realtime endpoint and feeds every envelope into `router`
/// until the socket closes.
pub async fn spawn_listener(
    ws_url: Url,
    auth_token: Option<String>,
    router: Arc<RealtimeEventRouter>,
) -> FeedResult<JoinHandle<()>> {
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|err| FeedError::Config(format!("invalid websocket url '{ws_url}': {err}")))?;
    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| FeedError::Config(format!("invalid auth token: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|err| FeedError::Transport(format!("failed to connect websocket {ws_url}: {err}")))?;
    info!(url = %ws_url, "realtime: websocket connected");
    let (_, mut ws_reader) = ws_stream.split();

    Ok(tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEnvelope>(&text) {
                    Ok(envelope) => router.route(envelope),
                    Err(err) => warn!(error = %err, "realtime: discarding malformed frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "realtime: websocket receive failed");
                    break;
                }
            }
        }
        info!("realtime: websocket closed");
    }))
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
