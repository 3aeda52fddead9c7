//! Contact records and per-contact message history.

use std::sync::Arc;

use missive_shared::types::{now_millis, UserId};
use missive_store::{ListQuery, StoreExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::ClientContext;
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub unread: bool,
    pub timestamp: i64,
}

/// Fields to merge into a contact. `None` or empty strings keep what is stored.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub name: Option<String>,
    pub photo: Option<String>,
    pub blocked: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub to: UserId,
    pub from: UserId,
    pub plaintext: Value,
    pub timestamp: i64,
    pub status: MessageStatus,
}

fn merge(new: Option<String>, old: Option<String>) -> Option<String> {
    new.filter(|v| !v.is_empty()).or(old)
}

pub struct ContactRegistry {
    ctx: Arc<ClientContext>,
}

impl ContactRegistry {
    pub fn new(ctx: Arc<ClientContext>) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: &UserId) -> Result<Option<Contact>, ClientError> {
        Ok(self.ctx.store.get_as(&self.ctx.contact_path(id)).await?)
    }

    /// Merge `profile` over the stored contact (creating it if needed),
    /// set the unread flag and stamp the update time.
    pub async fn upsert(&self, id: &UserId, profile: Profile, unread: bool) -> Result<Contact, ClientError> {
        let existing = self.get(id).await?;
        let (name, photo, blocked) = match existing {
            Some(c) => (c.name, c.photo, c.blocked),
            None => (None, None, false),
        };

        let contact = Contact {
            user_id: *id,
            name: merge(profile.name, name),
            photo: merge(profile.photo, photo),
            blocked: profile.blocked.unwrap_or(blocked),
            unread,
            timestamp: now_millis(),
        };
        self.ctx.store.put_as(&self.ctx.contact_path(id), &contact).await?;
        Ok(contact)
    }

    pub async fn block(&self, id: &UserId, blocked: bool) -> Result<Contact, ClientError> {
        let unread = self.get(id).await?.map(|c| c.unread).unwrap_or(false);
        let profile = Profile {
            blocked: Some(blocked),
            ..Profile::default()
        };
        self.upsert(id, profile, unread).await
    }

    pub async fn is_blocked(&self, id: &UserId) -> Result<bool, ClientError> {
        Ok(self.get(id).await?.map(|c| c.blocked).unwrap_or(false))
    }

    /// Contacts in key order.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<Contact>, ClientError> {
        let mut query = ListQuery::values();
        query.limit = limit;
        let entries = self.ctx.store.list(&self.ctx.contacts_path(), query).await?;

        let mut contacts = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(value) = entry.value else { continue };
            match serde_json::from_value(value) {
                Ok(contact) => contacts.push(contact),
                Err(e) => warn!(key = %entry.key, error = %e, "Skipping unreadable contact"),
            }
        }
        Ok(contacts)
    }

    pub async fn record_message(&self, id: &UserId, key: &str, record: &MessageRecord) -> Result<(), ClientError> {
        self.ctx
            .store
            .put_as(&self.ctx.messages_path(id).join(key), record)
            .await?;
        Ok(())
    }

    pub async fn has_message(&self, id: &UserId, key: &str) -> Result<bool, ClientError> {
        let path = self.ctx.messages_path(id).join(key);
        Ok(self.ctx.store.get(&path).await?.is_some())
    }

    /// Message history with `id`, oldest first, as `(key, record)` pairs.
    pub async fn list_messages(
        &self,
        id: &UserId,
        limit: Option<usize>,
    ) -> Result<Vec<(String, MessageRecord)>, ClientError> {
        let mut query = ListQuery::values();
        query.limit = limit;
        let entries = self.ctx.store.list(&self.ctx.messages_path(id), query).await?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(value) = entry.value {
                messages.push((entry.key, serde_json::from_value(value)?));
            }
        }
        Ok(messages)
    }

    /// Drop the message history; the contact and its session stay.
    pub async fn clear(&self, id: &UserId) -> Result<(), ClientError> {
        self.ctx.store.del(&self.ctx.messages_path(id)).await?;
        Ok(())
    }

    /// Drop the contact with everything stored below it.
    pub async fn delete(&self, id: &UserId) -> Result<(), ClientError> {
        self.ctx.store.del(&self.ctx.contact_path(id)).await?;
        Ok(())
    }
}
