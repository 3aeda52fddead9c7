//! The client facade: one `Messenger` per local identity.

use std::sync::Arc;

use missive_shared::constants::MAX_FETCH_LIMIT;
use missive_shared::identity::Identity;
use missive_shared::prekey::{Card, Prekey};
use missive_shared::protocol::{inbox_key, InboxEntry, LiveAuth, Payload, PushSubscription};
use missive_shared::types::UserId;
use missive_store::{Store, StoreExt};
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::api::ServerApi;
use crate::config::ClientConfig;
use crate::contacts::{Contact, ContactRegistry, MessageRecord, MessageStatus, Profile};
use crate::context::ClientContext;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::prekey::PrekeyManager;
use crate::push::{PushPermission, PushProvider};
use crate::session::SessionManager;
use crate::transport::{HttpTransport, Transport};

pub struct Messenger {
    ctx: Arc<ClientContext>,
    prekeys: Arc<PrekeyManager>,
    api: Arc<ServerApi>,
    contacts: Arc<ContactRegistry>,
    sessions: SessionManager,
    push: Option<Arc<dyn PushProvider>>,
    ready: OnceCell<()>,
}

impl Messenger {
    pub fn new(config: ClientConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        let ctx = Arc::new(ClientContext::new(config, store, transport));
        let prekeys = Arc::new(PrekeyManager::new(ctx.clone()));
        let api = Arc::new(ServerApi::new(ctx.clone(), prekeys.clone()));
        let contacts = Arc::new(ContactRegistry::new(ctx.clone()));
        let sessions = SessionManager::new(ctx.clone(), api.clone(), prekeys.clone(), contacts.clone());
        Self {
            ctx,
            prekeys,
            api,
            contacts,
            sessions,
            push: None,
            ready: OnceCell::new(),
        }
    }

    /// Messenger talking HTTP to `config.server_url`.
    pub fn with_http(config: ClientConfig, store: Arc<dyn Store>) -> Self {
        let transport = Arc::new(HttpTransport::new(&config.server_url));
        Self::new(config, store, transport)
    }

    pub fn with_push(mut self, provider: Arc<dyn PushProvider>) -> Self {
        self.push = Some(provider);
        self
    }

    /// Load or create the identity and make sure a prekey is published.
    /// Runs once; later calls return immediately.
    pub async fn ensure_ready(&self) -> Result<(), ClientError> {
        self.ready
            .get_or_try_init(|| async {
                let identity = self.ctx.identity().await?;
                self.prekeys.ensure_current(&self.api).await?;
                info!(user = %identity.user_id().short(), "Messenger ready");
                Ok::<(), ClientError>(())
            })
            .await?;
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub async fn identity(&self) -> Result<&Identity, ClientError> {
        self.ctx.identity().await
    }

    pub async fn user_id(&self) -> Result<UserId, ClientError> {
        self.ctx.user_id().await
    }

    /// Our card as the server should have it.
    pub async fn card(&self) -> Result<Card, ClientError> {
        Ok(Card {
            user: self.ctx.user_id().await?,
            opk: self.prekeys.current().await?.one_time_key(),
        })
    }

    /// Receiver for client events. Subscribing again replaces the previous receiver.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.ctx.events.subscribe()
    }

    /// First frame of a live connection.
    pub async fn live_auth(&self) -> Result<LiveAuth, ClientError> {
        let tokens = self.api.tokens().await?;
        Ok(LiveAuth {
            id: self.ctx.user_id().await?,
            token: tokens.user_token,
        })
    }

    // --- Messages ---

    pub async fn send_message(&self, to: &UserId, plaintext: Value) -> Result<MessageRecord, ClientError> {
        self.ensure_ready().await?;
        let sent = self
            .sessions
            .send(to, &Payload::Message(plaintext.clone()))
            .await?;

        let record = MessageRecord {
            to: *to,
            from: self.ctx.user_id().await?,
            plaintext,
            timestamp: sent.timestamp,
            status: MessageStatus::Sent,
        };
        self.contacts
            .record_message(to, &inbox_key(sent.timestamp), &record)
            .await?;
        self.contacts.upsert(to, Profile::default(), false).await?;
        debug!(to = %to.short(), timestamp = sent.timestamp, "Sent message");
        Ok(record)
    }

    /// Fetch up to `limit` inbox entries, read them, acknowledge them all,
    /// and keep the published prekey fresh.
    pub async fn get_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, ClientError> {
        self.ensure_ready().await?;
        // the server never returns more than this, so a full page means more is queued
        let limit = limit.clamp(1, MAX_FETCH_LIMIT);

        let sub = self.stored_subscription().await?.map(|s| s.keys.auth);
        let entries = self.api.messages(limit, sub).await?;

        let mut messages = Vec::new();
        let mut keys = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.read_entry(entry).await {
                Ok(Some(record)) => messages.push(record),
                Ok(None) => {}
                Err(e) => warn!(key = %entry.key, error = %e, "Failed to read inbox entry"),
            }
            keys.push(entry.key.clone());
        }

        if !keys.is_empty() {
            self.api.acknowledge(keys).await?;
        }

        if entries.len() < limit && self.prekeys.is_used().await? {
            self.prekeys.rotate(&self.api).await?;
        } else {
            let prekey = self.prekeys.current().await?;
            self.prekeys.publish_quietly(&self.api, &prekey).await;
        }

        if !messages.is_empty() {
            debug!(count = messages.len(), "Fetched messages");
            self.ctx.events.emit(ClientEvent::GotMessages(messages.clone()));
        }
        Ok(messages)
    }

    /// Read one inbox entry without acknowledging it.
    pub async fn read_entry(&self, entry: &InboxEntry) -> Result<Option<MessageRecord>, ClientError> {
        self.sessions.read(&entry.key, &entry.data).await
    }

    pub async fn rotate_prekey(&self) -> Result<Prekey, ClientError> {
        self.prekeys.rotate(&self.api).await
    }

    pub async fn publish_prekey(&self) -> Result<(), ClientError> {
        self.prekeys.publish(&self.api).await
    }

    // --- Contacts ---

    pub async fn contact(&self, id: &UserId) -> Result<Option<Contact>, ClientError> {
        self.contacts.get(id).await
    }

    pub async fn contacts(&self, limit: Option<usize>) -> Result<Vec<Contact>, ClientError> {
        self.contacts.list(limit).await
    }

    pub async fn upsert_contact(&self, id: &UserId, profile: Profile) -> Result<Contact, ClientError> {
        let unread = self.contacts.get(id).await?.map(|c| c.unread).unwrap_or(false);
        self.contacts.upsert(id, profile, unread).await
    }

    pub async fn mark_read(&self, id: &UserId) -> Result<Contact, ClientError> {
        self.contacts.upsert(id, Profile::default(), false).await
    }

    pub async fn block_contact(&self, id: &UserId, blocked: bool) -> Result<Contact, ClientError> {
        self.contacts.block(id, blocked).await
    }

    pub async fn messages_with(
        &self,
        id: &UserId,
        limit: Option<usize>,
    ) -> Result<Vec<(String, MessageRecord)>, ClientError> {
        self.contacts.list_messages(id, limit).await
    }

    pub async fn clear_contact(&self, id: &UserId) -> Result<(), ClientError> {
        self.contacts.clear(id).await
    }

    /// Tell the contact to forget our session, then drop everything we keep about it.
    pub async fn remove_contact(&self, id: &UserId) -> Result<(), ClientError> {
        if let Err(e) = self.sessions.reset(id).await {
            warn!(contact = %id.short(), error = %e, "Reset before removal failed");
        }
        self.contacts.delete(id).await?;
        info!(contact = %id.short(), "Removed contact");
        Ok(())
    }

    /// Start a new session with `id` on the next message.
    pub async fn reset_session(&self, id: &UserId) -> Result<(), ClientError> {
        self.sessions.reset(id).await
    }

    // --- Account ---

    /// Delete the account on the server, then every local record.
    pub async fn delete_me(&self) -> Result<(), ClientError> {
        self.api.delete_me().await?;
        if let Err(e) = self.unsubscribe().await {
            warn!(error = %e, "Push unsubscribe during account deletion failed");
        }
        self.ctx.store.del(self.ctx.root()).await?;
        info!("Deleted account");
        Ok(())
    }

    // --- Push ---

    async fn stored_subscription(&self) -> Result<Option<PushSubscription>, ClientError> {
        Ok(self.ctx.store.get_as(&self.ctx.push_path()).await?)
    }

    pub async fn is_subscribed(&self) -> Result<bool, ClientError> {
        Ok(self.stored_subscription().await?.is_some())
    }

    pub async fn subscribe(&self) -> Result<PushSubscription, ClientError> {
        let provider = self
            .push
            .as_ref()
            .ok_or_else(|| ClientError::Push("no push provider".into()))?;
        if provider.permission().await == PushPermission::Denied {
            return Err(ClientError::Push("permission denied".into()));
        }

        let subscription = provider.subscribe().await?;
        self.api.subscribe(subscription.clone()).await?;
        self.ctx.store.put_as(&self.ctx.push_path(), &subscription).await?;
        info!(endpoint = %subscription.endpoint, "Subscribed to push");
        Ok(subscription)
    }

    /// Returns `false` when there was no subscription.
    pub async fn unsubscribe(&self) -> Result<bool, ClientError> {
        let Some(subscription) = self.stored_subscription().await? else {
            return Ok(false);
        };
        self.api.unsubscribe(subscription.clone()).await?;
        if let Some(provider) = &self.push {
            provider.unsubscribe(&subscription).await?;
        }
        self.ctx.store.del(&self.ctx.push_path()).await?;
        info!(endpoint = %subscription.endpoint, "Unsubscribed from push");
        Ok(true)
    }
}
