use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::path::{unescape, StorePath};
use crate::{Entry, ListQuery, Store};

/// In-process store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(path.as_str()).cloned())
    }

    async fn put(&self, path: &StorePath, value: Value) -> Result<()> {
        self.entries.write().await.insert(path.to_string(), value);
        Ok(())
    }

    async fn del(&self, path: &StorePath) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(path.as_str());
        let doomed: Vec<String> = entries
            .range(path.descendants_start()..path.descendants_end())
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn list(&self, path: &StorePath, query: ListQuery) -> Result<Vec<Entry>> {
        let entries = self.entries.read().await;
        let prefix = path.descendants_start();
        let children = entries
            .range(prefix.clone()..path.descendants_end())
            .filter_map(|(key, value)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| Entry {
                    key: unescape(rest),
                    value: query.values.then(|| value.clone()),
                })
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(children)
    }
}
