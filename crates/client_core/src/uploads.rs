use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{ChannelId, FileId, FileRecord, FileTransferState, PendingToken},
    protocol::FileInfoPayload,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    error::{persistence, FeedResult},
    feed::FeedState,
    transport::{AttachmentTransport, AttachmentUpload},
};

#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    Queued,
    Uploading { progress: f64 },
    /// Transfer done; the file is being recorded and attached. No longer
    /// cancellable.
    Finishing,
    Uploaded { file_id: FileId },
    Failed { reason: String },
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Uploaded { .. } | UploadState::Failed { .. } | UploadState::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, UploadState::Queued | UploadState::Uploading { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadEvent {
    pub item_id: String,
    pub state: UploadState,
}

/// One file waiting to be attached to the post created by `owner`.
#[derive(Debug, Clone)]
pub struct AttachmentItem {
    pub item_id: String,
    pub channel_id: ChannelId,
    pub owner: PendingToken,
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

struct UploadEntry {
    state: UploadState,
    cancel: watch::Sender<bool>,
}

struct Shared {
    transport: Arc<dyn AttachmentTransport>,
    feed: Arc<FeedState>,
    items: Mutex<HashMap<String, UploadEntry>>,
    events: broadcast::Sender<UploadEvent>,
}

impl Shared {
    fn items(&self) -> MutexGuard<'_, HashMap<String, UploadEntry>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a live item to `state`. Items already finished keep their state.
    fn transition(&self, item_id: &str, state: UploadState) -> bool {
        self.transition_if(item_id, state, |current| !current.is_terminal())
    }

    /// Moves the item to `state` only while `allowed` holds for its current
    /// state. Check and update happen under one lock.
    fn transition_if(
        &self,
        item_id: &str,
        state: UploadState,
        allowed: impl FnOnce(&UploadState) -> bool,
    ) -> bool {
        {
            let mut items = self.items();
            let Some(entry) = items.get_mut(item_id) else {
                return false;
            };
            if !allowed(&entry.state) {
                return false;
            }
            entry.state = state.clone();
        }
        let _ = self.events.send(UploadEvent {
            item_id: item_id.to_string(),
            state,
        });
        true
    }
}

/// Runs attachment uploads and attaches finished files to their posts.
#[derive(Clone)]
pub struct AttachmentUploadCoordinator {
    shared: Arc<Shared>,
}

impl AttachmentUploadCoordinator {
    pub fn new(transport: Arc<dyn AttachmentTransport>, feed: Arc<FeedState>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                transport,
                feed,
                items: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self, item_id: &str) -> Option<UploadState> {
        self.shared
            .items()
            .get(item_id)
            .map(|entry| entry.state.clone())
    }

    /// Starts uploading `item`. Returns `None` while the same item id still
    /// has an upload that has not finished.
    pub fn enqueue(&self, item: AttachmentItem) -> Option<JoinHandle<UploadState>> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut items = self.shared.items();
            if items
                .get(&item.item_id)
                .is_some_and(|entry| !entry.state.is_terminal())
            {
                warn!(item_id = %item.item_id, "uploads: item already active");
                return None;
            }
            items.insert(
                item.item_id.clone(),
                UploadEntry {
                    state: UploadState::Queued,
                    cancel: cancel_tx,
                },
            );
        }
        let _ = self.shared.events.send(UploadEvent {
            item_id: item.item_id.clone(),
            state: UploadState::Queued,
        });

        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(run_upload(shared, item, cancel_rx)))
    }

    /// Requests cancellation. Returns `false` when the item is unknown,
    /// already finished or past the point where its file gets attached.
    pub fn cancel(&self, item_id: &str) -> bool {
        let cancelled = self
            .shared
            .transition_if(item_id, UploadState::Cancelled, UploadState::is_cancellable);
        if cancelled {
            if let Some(entry) = self.shared.items().get(item_id) {
                entry.cancel.send_replace(true);
            }
            info!(item_id = %item_id, "uploads: cancelled");
        }
        cancelled
    }
}

async fn run_upload(
    shared: Arc<Shared>,
    item: AttachmentItem,
    mut cancel: watch::Receiver<bool>,
) -> UploadState {
    let item_id = item.item_id.clone();
    if !shared.transition(&item_id, UploadState::Uploading { progress: 0.0 }) {
        return UploadState::Cancelled;
    }

    let upload = AttachmentUpload {
        client_id: item.item_id.clone(),
        channel_id: item.channel_id.clone(),
        filename: item.filename.clone(),
        mime_type: item.mime_type.clone(),
        bytes: item.bytes,
    };
    let progress_shared = Arc::clone(&shared);
    let progress_id = item_id.clone();
    let report = move |fraction: f64| {
        let progress = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        progress_shared.transition_if(
            &progress_id,
            UploadState::Uploading { progress },
            UploadState::is_cancellable,
        );
    };

    let result = tokio::select! {
        result = shared.transport.upload(&upload, &report, cancel.clone()) => result,
        _ = cancel.wait_for(|cancelled| *cancelled) => {
            return UploadState::Cancelled;
        }
    };

    let final_state = match result {
        Ok(info) => {
            if !shared.transition_if(&item_id, UploadState::Finishing, UploadState::is_cancellable) {
                info!(item_id = %item_id, "uploads: ignoring completion after cancellation");
                return UploadState::Cancelled;
            }
            match complete(&shared, &item.channel_id, &item.owner, info).await {
                Ok(file_id) => UploadState::Uploaded { file_id },
                Err(err) => UploadState::Failed {
                    reason: err.to_string(),
                },
            }
        }
        Err(err) => {
            warn!(item_id = %item_id, error = %err, "uploads: transfer failed");
            UploadState::Failed {
                reason: err.to_string(),
            }
        }
    };
    if shared.transition(&item_id, final_state.clone()) {
        final_state
    } else {
        UploadState::Cancelled
    }
}

async fn complete(
    shared: &Shared,
    channel_id: &ChannelId,
    owner: &PendingToken,
    info: FileInfoPayload,
) -> FeedResult<FileId> {
    let file_id = info.id;
    let owning_key = shared.feed.owning_key(channel_id, owner).await;
    let mut record = FileRecord::remote(file_id.clone(), channel_id.clone(), owning_key);
    record.state = FileTransferState::Uploaded;
    record.name = Some(info.name);
    record.extension = info.extension;
    record.mime_type = info.mime_type;
    record.size_bytes = Some(info.size);
    shared
        .feed
        .store()
        .upsert_file(&record)
        .await
        .map_err(persistence)?;
    shared
        .feed
        .attach_file(channel_id, owner, file_id.clone())
        .await?;
    info!(channel_id = %channel_id, file_id = %file_id, "uploads: attached file to post");
    Ok(file_id)
}

#[cfg(test)]
#[path = "tests/uploads_tests.rs"]
mod tests;
