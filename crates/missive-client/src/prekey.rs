//! Lifecycle of the one-time prekey: create, publish, consume, rotate.
//!
//! At most one prekey is current. It is cached in memory, persisted under
//! `<parent>/user/opk`, and guarded by a mutex so that consumption is a
//! single `used: false -> true` transition. The mutex is never held while
//! talking to the server.

use std::sync::Arc;

use missive_shared::prekey::Prekey;
use missive_store::StoreExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::ServerApi;
use crate::context::ClientContext;
use crate::error::ClientError;

pub struct PrekeyManager {
    ctx: Arc<ClientContext>,
    current: Mutex<Option<Prekey>>,
}

impl PrekeyManager {
    pub fn new(ctx: Arc<ClientContext>) -> Self {
        Self {
            ctx,
            current: Mutex::new(None),
        }
    }

    /// Current prekey, creating (but not publishing) one if there is none.
    pub async fn current(&self) -> Result<Prekey, ClientError> {
        Ok(self.load_or_create().await?.0)
    }

    /// Like [`current`](Self::current), but publishes a newly created prekey.
    pub async fn ensure_current(&self, api: &ServerApi) -> Result<Prekey, ClientError> {
        let (prekey, created) = self.load_or_create().await?;
        if created {
            self.publish_quietly(api, &prekey).await;
        }
        Ok(prekey)
    }

    async fn load_or_create(&self) -> Result<(Prekey, bool), ClientError> {
        let mut current = self.current.lock().await;
        if let Some(prekey) = current.as_ref() {
            return Ok((prekey.clone(), false));
        }

        let path = self.ctx.prekey_path();
        if let Some(stored) = self.ctx.store.get_as::<Prekey>(&path).await? {
            *current = Some(stored.clone());
            return Ok((stored, false));
        }

        let prekey = self.ctx.identity().await?.create_prekey();
        self.ctx.store.put_as(&path, &prekey).await?;
        debug!(opk = %prekey.id, "Created prekey");
        *current = Some(prekey.clone());
        Ok((prekey, true))
    }

    /// Replace the current prekey with a fresh one and publish it.
    pub async fn rotate(&self, api: &ServerApi) -> Result<Prekey, ClientError> {
        let prekey = {
            let mut current = self.current.lock().await;
            let prekey = self.ctx.identity().await?.create_prekey();
            self.ctx.store.put_as(&self.ctx.prekey_path(), &prekey).await?;
            *current = Some(prekey.clone());
            prekey
        };
        info!(opk = %prekey.id, "Rotated prekey");
        self.publish_quietly(api, &prekey).await;
        Ok(prekey)
    }

    /// Publish the current prekey. Errors are returned to the caller.
    pub async fn publish(&self, api: &ServerApi) -> Result<(), ClientError> {
        let prekey = self.current().await?;
        api.publish_opk(prekey.one_time_key()).await?;
        Ok(())
    }

    pub(crate) async fn publish_quietly(&self, api: &ServerApi, prekey: &Prekey) {
        if let Err(e) = api.publish_opk(prekey.one_time_key()).await {
            warn!(opk = %prekey.id, error = %e, "Failed to publish prekey");
        }
    }

    /// The current prekey if its id is `opk_id`.
    pub async fn find(&self, opk_id: &str) -> Result<Option<Prekey>, ClientError> {
        let prekey = self.current().await?;
        Ok((prekey.id == opk_id).then_some(prekey))
    }

    /// Mark the prekey `opk_id` used. Returns `true` only for the caller that
    /// performed the transition.
    pub async fn consume(&self, opk_id: &str) -> Result<bool, ClientError> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.ctx.store.get_as::<Prekey>(&self.ctx.prekey_path()).await?;
        }
        let Some(prekey) = current.as_mut() else {
            return Ok(false);
        };
        if prekey.id != opk_id || prekey.used {
            return Ok(false);
        }

        let mut consumed = prekey.clone();
        consumed.used = true;
        self.ctx.store.put_as(&self.ctx.prekey_path(), &consumed).await?;
        *prekey = consumed;
        debug!(opk = %opk_id, "Consumed prekey");
        Ok(true)
    }

    pub async fn is_used(&self) -> Result<bool, ClientError> {
        Ok(self.current().await?.used)
    }
}
