use thiserror::Error;

/// All errors produced by the connectivity layer.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FeedError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket transport failure: {0}")]
    Transport(String),

    #[error("message serialization failed: {0}")]
    Serde(String),

    #[error("http backfill failed: {0}")]
    Http(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("client is not running")]
    NotRunning,
}

impl FeedError {
    /// Determine whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Transport(_) | FeedError::Http(_) => true,
            FeedError::Url(_)
            | FeedError::Serde(_)
            | FeedError::RetriesExhausted { .. }
            | FeedError::NotRunning => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(error: serde_json::Error) -> Self {
        FeedError::Serde(error.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(error: reqwest::Error) -> Self {
        FeedError::Http(error.to_string())
    }
}
