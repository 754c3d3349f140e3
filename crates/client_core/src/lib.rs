use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::UserId;
use storage::{LocalMessageStore, Storage};
use tokio::task::JoinHandle;
use tracing::info;

pub mod config;
pub mod error;
pub mod feed;
pub mod merge;
pub mod outbox;
pub mod pagination;
pub mod realtime;
pub mod sections;
pub mod transport;
pub mod uploads;

pub use config::{load_settings, prepare_database_url, ClientSettings};
pub use error::{FeedError, FeedResult};
pub use feed::{FeedEvent, FeedSnapshot, FeedState, MergeReport};
pub use merge::{MergeDirection, MergeEngine, MergeOutcome};
pub use outbox::Outbox;
pub use pagination::{AroundOutcome, LoadOutcome, LoadState, PageSummary, PaginationController};
pub use realtime::{RealtimeEventRouter, TypingRoster};
pub use sections::{Section, SectionEntry, SectionIndex};
pub use transport::{
    AttachmentTransport, AttachmentUpload, Direction, HttpFeedClient, Page, PostDraft,
    RemoteFeedClient,
};
pub use uploads::{AttachmentItem, AttachmentUploadCoordinator, UploadEvent, UploadState};

/// Every feed service wired around one store and one remote.
pub struct FeedClient {
    settings: ClientSettings,
    feed: Arc<FeedState>,
    pagination: PaginationController,
    outbox: Outbox,
    uploads: AttachmentUploadCoordinator,
    router: Arc<RealtimeEventRouter>,
}

impl FeedClient {
    /// Opens the local store named by `settings` and talks HTTP to its server.
    pub async fn connect(settings: ClientSettings, own_user: UserId) -> Result<Self> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let store = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open local store at {database_url}"))?;
        let http = Arc::new(HttpFeedClient::with_timeout(
            settings.server_url.clone(),
            settings.auth_token.clone(),
            settings.request_timeout(),
        )?);
        info!(server_url = %settings.server_url, database_url = %database_url, "client: connected");
        Ok(Self::from_parts(
            settings,
            own_user,
            Arc::new(store),
            http.clone(),
            http,
        ))
    }

    pub fn from_parts(
        settings: ClientSettings,
        own_user: UserId,
        store: Arc<dyn LocalMessageStore>,
        remote: Arc<dyn RemoteFeedClient>,
        attachments: Arc<dyn AttachmentTransport>,
    ) -> Self {
        let feed = Arc::new(FeedState::new(store, settings.section_offset()));
        let pagination = PaginationController::with_page_sizes(
            Arc::clone(&remote),
            Arc::clone(&feed),
            settings.page_size,
            settings.short_page_size,
        );
        let outbox = Outbox::new(remote, Arc::clone(&feed));
        let uploads = AttachmentUploadCoordinator::new(attachments, Arc::clone(&feed));
        let router = Arc::new(RealtimeEventRouter::new(Arc::clone(&feed), own_user));
        Self {
            settings,
            feed,
            pagination,
            outbox,
            uploads,
            router,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn feed(&self) -> &Arc<FeedState> {
        &self.feed
    }

    pub fn pagination(&self) -> &PaginationController {
        &self.pagination
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn uploads(&self) -> &AttachmentUploadCoordinator {
        &self.uploads
    }

    pub fn router(&self) -> &Arc<RealtimeEventRouter> {
        &self.router
    }

    /// Starts the websocket listener feeding the realtime router.
    pub async fn start_realtime(&self) -> FeedResult<JoinHandle<()>> {
        let ws_url = realtime::websocket_url(&self.settings.server_url)?;
        realtime::spawn_listener(ws_url, self.settings.auth_token.clone(), Arc::clone(&self.router))
            .await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
