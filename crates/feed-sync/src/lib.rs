/// Client-side reconciliation for a social feed
/// Merges optimistic local mutations, request/response confirmations and
/// broadcast events from the push channel into one consistent view.
use thiserror::Error;

mod config;
pub use config::*;

mod events;
pub use events::*;

mod channel;
pub use channel::*;

mod gateway;
pub use gateway::*;

mod http;
pub use http::*;

mod storage;
pub use storage::*;

mod store;
pub use store::*;

mod reconcile;
pub use reconcile::*;

mod presence;
pub use presence::*;

mod session;
pub use session::*;

pub use feed_model;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl FeedError {
    /// Transient failures the user may retry by hand.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::NetworkError(_))
    }
}

impl From<feed_model::FeedModelError> for FeedError {
    fn from(e: feed_model::FeedModelError) -> Self {
        FeedError::ValidationError(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
