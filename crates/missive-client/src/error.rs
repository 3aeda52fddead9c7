use missive_shared::error::{CryptoError, IdentityError, SessionError};
use missive_shared::types::UserId;
use missive_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with an error body
    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    /// The request never got an answer
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No published card for {0}")]
    CardNotFound(UserId),

    #[error("Push error: {0}")]
    Push(String),

    #[error("Live connection error: {0}")]
    Live(String),
}

impl ClientError {
    /// `true` for a server answer with the given status code.
    pub fn is_status(&self, status: u16) -> bool {
        matches!(self, ClientError::Server { code, .. } if *code == status)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Live(e.to_string())
    }
}
