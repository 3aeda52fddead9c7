//! Process-wide client state shared by every component.
//!
//! Local store layout under the parent channel:
//!
//! ```text
//! <parent>/user                          identity export
//! <parent>/user/opk                      current prekey
//! <parent>/token/<id>                    cached tokens
//! <parent>/contacts/<id>                 contact record
//! <parent>/contacts/<id>/session         ratchet state
//! <parent>/contacts/<id>/stale           previous ratchet state
//! <parent>/contacts/<id>/messages/<key>  message history
//! <parent>/push                          push subscription
//! ```

use std::sync::Arc;

use missive_shared::identity::{Identity, IdentityExport};
use missive_shared::types::UserId;
use missive_store::{Store, StoreExt, StorePath};
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::EventHub;
use crate::transport::Transport;

pub struct ClientContext {
    pub config: ClientConfig,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub events: EventHub,
    root: StorePath,
    identity: OnceCell<Identity>,
}

impl ClientContext {
    pub fn new(config: ClientConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        let root = StorePath::root(&config.parent_channel);
        Self {
            config,
            store,
            transport,
            events: EventHub::default(),
            root,
            identity: OnceCell::new(),
        }
    }

    /// The local identity: the configured one, else the stored one, else a new one.
    pub async fn identity(&self) -> Result<&Identity, ClientError> {
        self.identity.get_or_try_init(|| self.load_identity()).await
    }

    async fn load_identity(&self) -> Result<Identity, ClientError> {
        let path = self.user_path();

        if let Some(export) = &self.config.user_data {
            let identity = Identity::from_export(export)?;
            self.store.put_as(&path, export).await?;
            return Ok(identity);
        }

        if let Some(export) = self.store.get_as::<IdentityExport>(&path).await? {
            return Ok(Identity::from_export(&export)?);
        }

        let identity = Identity::generate();
        self.store.put_as(&path, &identity.to_export()).await?;
        info!(user = %identity.user_id().short(), "Created identity");
        Ok(identity)
    }

    pub async fn user_id(&self) -> Result<UserId, ClientError> {
        Ok(self.identity().await?.user_id())
    }

    pub fn root(&self) -> &StorePath {
        &self.root
    }

    pub fn user_path(&self) -> StorePath {
        self.root.join("user")
    }

    pub fn prekey_path(&self) -> StorePath {
        self.user_path().join("opk")
    }

    pub fn token_path(&self, user: &UserId) -> StorePath {
        self.root.join("token").join(user.to_hex())
    }

    pub fn contacts_path(&self) -> StorePath {
        self.root.join("contacts")
    }

    pub fn contact_path(&self, contact: &UserId) -> StorePath {
        self.contacts_path().join(contact.to_hex())
    }

    pub fn session_path(&self, contact: &UserId) -> StorePath {
        self.contact_path(contact).join("session")
    }

    pub fn stale_path(&self, contact: &UserId) -> StorePath {
        self.contact_path(contact).join("stale")
    }

    pub fn messages_path(&self, contact: &UserId) -> StorePath {
        self.contact_path(contact).join("messages")
    }

    pub fn push_path(&self) -> StorePath {
        self.root.join("push")
    }
}
