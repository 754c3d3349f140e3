use shared::domain::PostKey;
use thiserror::Error;

/// Errors surfaced by feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network failure or timeout. Never retried automatically.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server has no further pages in the requested direction.
    ///
    /// Pagination turns this into a successful last-page outcome.
    #[error("no more data in this direction")]
    NoMoreData,
    /// Non-2xx response that is not the no-more-data sentinel.
    #[error("server rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("malformed server response: {0}")]
    Decode(String),
    /// Local store failure; fatal to the current operation only.
    #[error("local persistence failed: {0:#}")]
    Persistence(#[source] anyhow::Error),
    #[error("post {0} is not in the local feed")]
    UnknownPost(PostKey),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FeedError {
    pub fn is_no_more_data(&self) -> bool {
        matches!(self, FeedError::NoMoreData)
    }

    /// Whether a user-initiated retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Transport(_) => true,
            FeedError::Rejected { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FeedError::Decode(err.to_string())
        } else {
            FeedError::Transport(err.to_string())
        }
    }
}

pub(crate) fn persistence(err: anyhow::Error) -> FeedError {
    FeedError::Persistence(err)
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
