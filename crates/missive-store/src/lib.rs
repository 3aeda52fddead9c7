//! # missive-store
//!
//! Path-addressed JSON storage shared by the Missive client and server.
//!
//! Records live at slash-separated [`StorePath`]s. A [`Store`] can read,
//! write and delete a single path (deletes take the whole subtree with
//! them) and list the direct children of a path in ascending key order.
//! Two backends ship with the crate: [`MemoryStore`] for tests and
//! ephemeral servers, and [`SqliteStore`], a single-table SQLite database.

pub mod database;
pub mod memory;
pub mod migrations;
pub mod path;

mod error;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub use database::SqliteStore;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use path::StorePath;

/// One child returned by [`Store::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Last path segment of the child
    pub key: String,
    /// Present only when the query asked for values
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub values: bool,
}

impl ListQuery {
    /// Keys and values of every child
    pub fn values() -> Self {
        Self {
            limit: None,
            values: true,
        }
    }

    /// Keys only
    pub fn keys() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// `Ok(None)` when nothing is stored at `path`.
    async fn get(&self, path: &StorePath) -> Result<Option<Value>>;

    async fn put(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Remove `path` and everything below it. Removing nothing is not an error.
    async fn del(&self, path: &StorePath) -> Result<()>;

    /// Direct children of `path` that hold a value, ascending by key.
    async fn list(&self, path: &StorePath, query: ListQuery) -> Result<Vec<Entry>>;
}

/// Typed helpers over any [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    async fn get_as<T>(&self, path: &StorePath) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn put_as<T>(&self, path: &StorePath, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.put(path, value).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
