//! Typed calls to the server, with token caching.

use std::sync::Arc;

use missive_shared::envelope::{self, Envelope};
use missive_shared::prekey::{Card, OneTimeKey};
use missive_shared::protocol::{
    AcknowledgeRequest, CardQuery, CardRequest, DeleteMeRequest, Deleted, HelloResponse, InboxEntry,
    MessagesRequest, OpkRequest, PushSubscription, SendRequest, SendResponse, SubscribeRequest,
    Subscribed, Unsubscribed, Updated,
};
use missive_shared::token::Claims;
use missive_shared::types::{now_secs, UserId};
use missive_store::StoreExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ClientContext;
use crate::error::ClientError;
use crate::prekey::PrekeyManager;

/// Tokens from the last `hello`, kept until the user token expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(rename = "anonToken")]
    pub anon_token: String,
    #[serde(rename = "userToken")]
    pub user_token: String,
    pub decoded: Claims,
    /// Identity of the server that issued the tokens
    #[serde(rename = "serverIDK")]
    pub server_idk: UserId,
}

impl TokenCache {
    fn is_fresh(&self) -> bool {
        self.decoded.exp > now_secs()
    }
}

pub struct ServerApi {
    ctx: Arc<ClientContext>,
    prekeys: Arc<PrekeyManager>,
}

impl ServerApi {
    pub fn new(ctx: Arc<ClientContext>, prekeys: Arc<PrekeyManager>) -> Self {
        Self { ctx, prekeys }
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_value(request)?;
        let response = self.ctx.transport.post(method, body).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Seal `request` to the server and post it.
    async fn call_sealed<Req, Resp>(
        &self,
        method: &str,
        server: &UserId,
        request: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let identity = self.ctx.identity().await?;
        let sealed = envelope::seal(identity, server, request)?;
        self.call(method, &sealed).await
    }

    /// Cached tokens, or fresh ones from `hello` once they expire.
    pub async fn tokens(&self) -> Result<TokenCache, ClientError> {
        let me = self.ctx.user_id().await?;
        let path = self.ctx.token_path(&me);

        if let Some(cached) = self.ctx.store.get_as::<TokenCache>(&path).await? {
            if cached.is_fresh() {
                return Ok(cached);
            }
        }

        let card = Card {
            user: me,
            opk: self.prekeys.current().await?.one_time_key(),
        };
        let sealed: Envelope = self.call("hello", &card).await?;
        let opened = envelope::open::<HelloResponse>(self.ctx.identity().await?, &sealed)?;

        let tokens = TokenCache {
            anon_token: opened.plaintext.anon_token,
            user_token: opened.plaintext.user_token,
            decoded: opened.plaintext.decoded,
            server_idk: opened.from,
        };
        self.ctx.store.put_as(&path, &tokens).await?;
        debug!(server = %tokens.server_idk.short(), exp = tokens.decoded.exp, "Refreshed tokens");
        Ok(tokens)
    }

    /// The card `user` last published, `None` when the server knows no such user.
    pub async fn card(&self, user: &UserId) -> Result<Option<Card>, ClientError> {
        let tokens = self.tokens().await?;
        let request = CardRequest {
            token: tokens.anon_token,
            msg: CardQuery { id: *user },
        };
        match self.call("card", &request).await {
            Ok(card) => Ok(Some(card)),
            Err(e) if e.is_status(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn send(&self, msg: Envelope) -> Result<SendResponse, ClientError> {
        let tokens = self.tokens().await?;
        let request = SendRequest {
            token: tokens.anon_token,
            msg,
        };
        self.call("send", &request).await
    }

    pub async fn messages(
        &self,
        limit: usize,
        sub: Option<String>,
    ) -> Result<Vec<InboxEntry>, ClientError> {
        let tokens = self.tokens().await?;
        let request = MessagesRequest {
            token: tokens.user_token,
            limit: Some(limit),
            sub,
            profile_key: None,
        };
        self.call_sealed("messages", &tokens.server_idk, &request).await
    }

    pub async fn publish_opk(&self, opk: OneTimeKey) -> Result<Updated, ClientError> {
        let tokens = self.tokens().await?;
        let request = OpkRequest {
            opk,
            token: tokens.user_token,
        };
        self.call_sealed("opk", &tokens.server_idk, &request).await
    }

    pub async fn acknowledge(&self, ids: Vec<String>) -> Result<Deleted, ClientError> {
        let tokens = self.tokens().await?;
        let request = AcknowledgeRequest {
            token: tokens.user_token,
            ids,
        };
        self.call_sealed("acknowledge", &tokens.server_idk, &request).await
    }

    pub async fn delete_me(&self) -> Result<Deleted, ClientError> {
        let tokens = self.tokens().await?;
        let request = DeleteMeRequest {
            delete: true,
            token: tokens.user_token,
        };
        self.call_sealed("deleteme", &tokens.server_idk, &request).await
    }

    pub async fn subscribe(&self, subscription: PushSubscription) -> Result<Subscribed, ClientError> {
        let tokens = self.tokens().await?;
        let request = SubscribeRequest {
            subscription,
            token: tokens.anon_token,
        };
        self.call("push/subscribe", &request).await
    }

    pub async fn unsubscribe(&self, subscription: PushSubscription) -> Result<Unsubscribed, ClientError> {
        let tokens = self.tokens().await?;
        let request = SubscribeRequest {
            subscription,
            token: tokens.anon_token,
        };
        self.call("push/unsubscribe", &request).await
    }
}
