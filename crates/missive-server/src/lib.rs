//! # missive-server
//!
//! Mailbox server for the Missive protocol.
//!
//! The server never reads user content. It provides:
//! - **Token service**: short-lived HMAC tokens for anonymous and
//!   identified requests
//! - **Card directory**: the one-time prekey each user last published
//! - **Inboxes**: sealed envelopes held until their recipient acknowledges them
//! - **Live delivery**: WebSocket "you have mail" signals and push notifications
//! - **REST API** (axum) exposing all of the above

pub mod api;
pub mod config;
pub mod error;
pub mod live;
pub mod mailroom;
pub mod push;
pub mod token;

use std::sync::Arc;

use missive_store::{MemoryStore, SqliteStore, Store, StoreError};

pub use config::ServerConfig;
pub use error::ServerError;
pub use mailroom::{InboxRecord, Mailroom, SendEvent};

/// Open the store selected by `config`: SQLite when a path is set, memory otherwise.
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>, StoreError> {
    Ok(match &config.database_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            Arc::new(SqliteStore::open_at(path)?)
        }
        None => {
            tracing::warn!("DATABASE_PATH not set, keeping all data in memory");
            Arc::new(MemoryStore::new())
        }
    })
}
