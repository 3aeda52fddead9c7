//! Server-side protocol core: tokens, published cards, inboxes and their
//! delivery notifications.
//!
//! Store layout under the parent channel:
//!
//! ```text
//! <parent>/serverUser                    server identity + token secret
//! <parent>/users/<id>                    inbox record
//! <parent>/users/<id>/opk                published card
//! <parent>/users/<id>/messages/<key>     pending envelopes
//! <parent>/push/<auth>                   push subscriptions
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use missive_shared::constants::MAX_FETCH_LIMIT;
use missive_shared::crypto::random_bytes;
use missive_shared::envelope::{self, Envelope};
use missive_shared::identity::{Identity, IdentityExport};
use missive_shared::prekey::Card;
use missive_shared::protocol::{
    inbox_key, AcknowledgeRequest, CardRequest, DeleteMeRequest, Deleted, HelloResponse, InboxEntry,
    LiveAuth, MessagesRequest, OpkRequest, PushSubscription, SendRequest, SendResponse,
    SubscribeRequest, Subscribed, Unsubscribed, Updated,
};
use missive_shared::types::{now_millis, UserId};
use missive_store::{ListQuery, Store, StoreExt, StorePath};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::live::{ConnectionId, LiveRouter};
use crate::push::{Notification, PushTransport};
use crate::token::TokenService;

/// Persisted server keys.
#[derive(Serialize, Deserialize)]
struct StoredKeys {
    user: IdentityExport,
    secret: String,
}

struct ServerKeys {
    identity: Identity,
    tokens: TokenService,
}

/// A user's inbox record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxRecord {
    pub user: UserId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
}

/// Emitted after every stored message.
#[derive(Debug, Clone)]
pub struct SendEvent {
    pub to: UserId,
    pub key: String,
    pub envelope: Envelope,
}

/// Requests sealed to the server carry the caller's user token.
trait Authenticated {
    fn token(&self) -> &str;
}

macro_rules! authenticated {
    ($($request:ty),*) => {
        $(impl Authenticated for $request {
            fn token(&self) -> &str {
                &self.token
            }
        })*
    };
}

authenticated!(MessagesRequest, OpkRequest, AcknowledgeRequest, DeleteMeRequest);

pub struct Mailroom {
    store: Arc<dyn Store>,
    root: StorePath,
    token_ttl_secs: i64,
    keys: OnceCell<ServerKeys>,
    live: LiveRouter,
    push: Arc<dyn PushTransport>,
    on_send: Mutex<Option<mpsc::UnboundedSender<SendEvent>>>,
}

impl Mailroom {
    pub fn new(
        store: Arc<dyn Store>,
        parent_channel: &str,
        token_ttl_secs: i64,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            store,
            root: StorePath::root(parent_channel),
            token_ttl_secs,
            keys: OnceCell::new(),
            live: LiveRouter::new(),
            push,
            on_send: Mutex::new(None),
        }
    }

    pub fn live(&self) -> &LiveRouter {
        &self.live
    }

    /// Receive an event for every stored message. Replaces any earlier receiver.
    pub fn on_send(&self) -> mpsc::UnboundedReceiver<SendEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.on_send.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// The server identity's public key.
    pub async fn identity(&self) -> Result<UserId, ServerError> {
        Ok(self.keys().await?.identity.user_id())
    }

    fn user_path(&self, user: &UserId) -> StorePath {
        self.root.join("users").join(user.to_hex())
    }

    fn inbox_path(&self, user: &UserId) -> StorePath {
        self.user_path(user).join("messages")
    }

    fn push_path(&self, auth: &str) -> StorePath {
        self.root.join("push").join(auth)
    }

    async fn keys(&self) -> Result<&ServerKeys, ServerError> {
        self.keys.get_or_try_init(|| self.load_keys()).await
    }

    async fn load_keys(&self) -> Result<ServerKeys, ServerError> {
        let path = self.root.join("serverUser");
        let (identity, secret) = match self.store.get_as::<StoredKeys>(&path).await? {
            Some(stored) => {
                let identity = Identity::from_export(&stored.user)
                    .map_err(|e| ServerError::Internal(format!("server identity: {e}")))?;
                let secret = hex::decode(&stored.secret)
                    .map_err(|e| ServerError::Internal(format!("token secret: {e}")))?;
                (identity, secret)
            }
            None => {
                let identity = Identity::generate();
                let secret = random_bytes::<32>().to_vec();
                let stored = StoredKeys {
                    user: identity.to_export(),
                    secret: hex::encode(&secret),
                };
                self.store.put_as(&path, &stored).await?;
                info!(server = %identity.user_id().short(), "Generated server identity");
                (identity, secret)
            }
        };
        let tokens = TokenService::new(secret, identity.user_id(), self.token_ttl_secs);
        Ok(ServerKeys { identity, tokens })
    }

    async fn require_anonymous(&self, token: &str) -> Result<(), ServerError> {
        if self.keys().await?.tokens.validate_anonymous(token) {
            Ok(())
        } else {
            Err(ServerError::Unauthorized)
        }
    }

    /// Open a request sealed to the server and check its user token.
    async fn open_request<T>(&self, envelope: &Envelope) -> Result<(UserId, T), ServerError>
    where
        T: DeserializeOwned + Authenticated,
    {
        let keys = self.keys().await?;
        let opened = envelope::open::<T>(&keys.identity, envelope).map_err(|e| {
            debug!(from = %envelope.from.short(), error = %e, "Unreadable request envelope");
            ServerError::Unreadable
        })?;
        if !keys.tokens.validate(opened.plaintext.token(), &opened.from.to_hex()) {
            return Err(ServerError::Unauthorized);
        }
        Ok((opened.from, opened.plaintext))
    }

    // --- Routes ---

    /// Issue an anonymous and a user token, sealed to the card's owner.
    pub async fn hello(&self, card: &Card) -> Result<Envelope, ServerError> {
        let keys = self.keys().await?;
        let (anon_token, _) = keys
            .tokens
            .issue_anonymous()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        let (user_token, decoded) = keys
            .tokens
            .issue(&card.user.to_hex())
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        let response = HelloResponse {
            anon_token,
            user_token,
            decoded,
        };
        debug!(user = %card.user.short(), "hello");
        envelope::seal(&keys.identity, &card.user, &response)
            .map_err(|e| ServerError::BadRequest(format!("cannot seal to card owner: {e}")))
    }

    pub async fn card(&self, request: &CardRequest) -> Result<Card, ServerError> {
        self.require_anonymous(&request.token).await?;
        self.lookup_card(&request.msg.id)
            .await?
            .ok_or(ServerError::NotFound)
    }

    /// The card currently published by `user`, if any.
    pub async fn lookup_card(&self, user: &UserId) -> Result<Option<Card>, ServerError> {
        Ok(self.store.get_as(&self.user_path(user).join("opk")).await?)
    }

    pub async fn send(&self, request: &SendRequest) -> Result<SendResponse, ServerError> {
        self.require_anonymous(&request.token).await?;

        let to = request.msg.to;
        let record: InboxRecord = self
            .store
            .get_as(&self.user_path(&to))
            .await?
            .ok_or(ServerError::NotFound)?;

        let timestamp = now_millis();
        let key = inbox_key(timestamp);
        self.store
            .put_as(&self.inbox_path(&to).join(&key), &request.msg)
            .await?;
        debug!(to = %to.short(), key = %key, "Stored message");

        self.deliver(&record, key, request.msg.clone()).await;

        Ok(SendResponse {
            sent: true,
            timestamp,
        })
    }

    async fn deliver(&self, record: &InboxRecord, key: String, envelope: Envelope) {
        let to = record.user;

        let listener = self
            .on_send
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = listener {
            let _ = tx.send(SendEvent {
                to,
                key,
                envelope,
            });
        }

        self.live.notify(&to).await;

        let Some(auth) = &record.sub else {
            return;
        };
        match self.store.get_as::<PushSubscription>(&self.push_path(auth)).await {
            Ok(Some(subscription)) => {
                if let Err(e) = self
                    .push
                    .send(&to, &subscription, &Notification::new_mail())
                    .await
                {
                    warn!(user = %to.short(), error = %e, "Push notification failed");
                }
            }
            Ok(None) => debug!(user = %to.short(), "Inbox names an unknown push subscription"),
            Err(e) => warn!(user = %to.short(), error = %e, "Push subscription lookup failed"),
        }
    }

    /// Pending messages of the caller, oldest first.
    pub async fn messages(&self, envelope: &Envelope) -> Result<Vec<InboxEntry>, ServerError> {
        let (from, request) = self
            .open_request::<MessagesRequest>(envelope)
            .await?;
        let limit = request
            .limit
            .unwrap_or(MAX_FETCH_LIMIT)
            .clamp(1, MAX_FETCH_LIMIT);

        let record = InboxRecord {
            user: from,
            timestamp: now_millis(),
            sub: request.sub,
            profile_key: request.profile_key,
        };
        self.store.put_as(&self.user_path(&from), &record).await?;

        let entries = self
            .store
            .list(&self.inbox_path(&from), ListQuery::values().limit(limit))
            .await?;

        let mut inbox = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(value) = entry.value else { continue };
            match serde_json::from_value::<Envelope>(value) {
                Ok(data) => inbox.push(InboxEntry {
                    key: entry.key,
                    data,
                }),
                Err(e) => warn!(user = %from.short(), key = %entry.key, error = %e, "Skipping corrupt inbox entry"),
            }
        }
        debug!(user = %from.short(), count = inbox.len(), limit, "messages");
        Ok(inbox)
    }

    /// Publish the caller's prekey. Registers the inbox on first use.
    pub async fn opk(&self, envelope: &Envelope) -> Result<Updated, ServerError> {
        let (from, request) = self.open_request::<OpkRequest>(envelope).await?;

        let card = Card {
            user: from,
            opk: request.opk,
        };
        self.store
            .put_as(&self.user_path(&from).join("opk"), &card)
            .await?;

        let path = self.user_path(&from);
        if self.store.get(&path).await?.is_none() {
            let record = InboxRecord {
                user: from,
                timestamp: now_millis(),
                sub: None,
                profile_key: None,
            };
            self.store.put_as(&path, &record).await?;
            info!(user = %from.short(), "Registered inbox");
        }

        debug!(user = %from.short(), opk = %card.opk.id, "Published prekey");
        Ok(Updated { updated: true })
    }

    /// Delete delivered messages. Unknown ids are ignored.
    pub async fn acknowledge(&self, envelope: &Envelope) -> Result<Deleted, ServerError> {
        let (from, request) = self
            .open_request::<AcknowledgeRequest>(envelope)
            .await?;

        let inbox = self.inbox_path(&from);
        for id in &request.ids {
            self.store.del(&inbox.join(id)).await?;
        }
        debug!(user = %from.short(), count = request.ids.len(), "acknowledge");
        Ok(Deleted { deleted: true })
    }

    pub async fn delete_me(&self, envelope: &Envelope) -> Result<Deleted, ServerError> {
        let (from, request) = self
            .open_request::<DeleteMeRequest>(envelope)
            .await?;
        if !request.delete {
            return Err(ServerError::BadRequest("delete flag not set".into()));
        }

        self.store.del(&self.user_path(&from)).await?;
        info!(user = %from.short(), "Deleted account");
        Ok(Deleted { deleted: true })
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscribed, ServerError> {
        self.require_anonymous(&request.token).await?;
        self.store
            .put_as(&self.push_path(&request.subscription.keys.auth), &request.subscription)
            .await?;
        Ok(Subscribed { subscribed: true })
    }

    pub async fn unsubscribe(&self, request: &SubscribeRequest) -> Result<Unsubscribed, ServerError> {
        self.require_anonymous(&request.token).await?;
        self.store
            .del(&self.push_path(&request.subscription.keys.auth))
            .await?;
        Ok(Unsubscribed { unsubscribed: true })
    }

    /// Validate the first frame of a live connection and register it.
    pub async fn authenticate_live(
        &self,
        auth: &LiveAuth,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<String>), ServerError> {
        if !self.keys().await?.tokens.validate(&auth.token, &auth.id.to_hex()) {
            return Err(ServerError::Unauthorized);
        }
        Ok(self.live.connect(auth.id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missive_shared::protocol::{CardQuery, PushKeys};
    use missive_store::MemoryStore;

    struct Client {
        identity: Identity,
        anon: String,
        user: String,
    }

    fn mailroom() -> Mailroom {
        Mailroom::new(
            Arc::new(MemoryStore::new()),
            "messages",
            1800,
            Arc::new(crate::push::TracingPush),
        )
    }

    async fn hello(mailroom: &Mailroom) -> Client {
        let identity = Identity::generate();
        let prekey = identity.create_prekey();
        let card = Card {
            user: identity.user_id(),
            opk: prekey.one_time_key(),
        };
        let sealed = mailroom.hello(&card).await.unwrap();
        let response = identity.open_envelope::<HelloResponse>(&sealed).unwrap().plaintext;
        assert_eq!(response.decoded.sub, identity.user_id().to_hex());

        let server = mailroom.identity().await.unwrap();
        let request = OpkRequest {
            opk: card.opk.clone(),
            token: response.user_token.clone(),
        };
        let envelope = identity.seal_envelope(&server, &request).unwrap();
        mailroom.opk(&envelope).await.unwrap();

        Client {
            identity,
            anon: response.anon_token,
            user: response.user_token,
        }
    }

    async fn sealed<T: Serialize>(mailroom: &Mailroom, client: &Client, body: &T) -> Envelope {
        let server = mailroom.identity().await.unwrap();
        client.identity.seal_envelope(&server, body).unwrap()
    }

    async fn send_to(mailroom: &Mailroom, from: &Client, to: &Client) -> SendResponse {
        let msg = from
            .identity
            .seal_envelope(&to.identity.user_id(), &serde_json::json!("hello"))
            .unwrap();
        mailroom
            .send(&SendRequest {
                token: from.anon.clone(),
                msg,
            })
            .await
            .unwrap()
    }

    async fn fetch(mailroom: &Mailroom, client: &Client) -> Vec<InboxEntry> {
        let request = MessagesRequest {
            token: client.user.clone(),
            ..Default::default()
        };
        mailroom
            .messages(&sealed(mailroom, client, &request).await)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_identity_survives_restart() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let push = Arc::new(crate::push::TracingPush);
        let first = Mailroom::new(store.clone(), "messages", 1800, push.clone());
        let second = Mailroom::new(store, "messages", 1800, push);
        assert_eq!(first.identity().await.unwrap(), second.identity().await.unwrap());
    }

    #[tokio::test]
    async fn test_card_lookup() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let bob = hello(&mailroom).await;

        let card = mailroom
            .card(&CardRequest {
                token: bob.anon.clone(),
                msg: CardQuery {
                    id: alice.identity.user_id(),
                },
            })
            .await
            .unwrap();
        assert_eq!(card.user, alice.identity.user_id());

        let missing = mailroom
            .card(&CardRequest {
                token: bob.anon.clone(),
                msg: CardQuery { id: UserId([9; 32]) },
            })
            .await;
        assert!(matches!(missing, Err(ServerError::NotFound)));

        // user tokens are not anonymous tokens
        let wrong = mailroom
            .card(&CardRequest {
                token: bob.user.clone(),
                msg: CardQuery {
                    id: alice.identity.user_id(),
                },
            })
            .await;
        assert!(matches!(wrong, Err(ServerError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_not_found() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let stranger = Identity::generate().user_id();
        let msg = alice
            .identity
            .seal_envelope(&stranger, &serde_json::json!(1))
            .unwrap();
        let result = mailroom
            .send(&SendRequest {
                token: alice.anon.clone(),
                msg,
            })
            .await;
        assert!(matches!(result, Err(ServerError::NotFound)));
    }

    #[tokio::test]
    async fn test_send_notifies_and_messages_lists_oldest_first() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let bob = hello(&mailroom).await;

        let mut events = mailroom.on_send();
        let (_, mut live) = mailroom.live().connect(bob.identity.user_id()).await;

        let first = send_to(&mailroom, &alice, &bob).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        send_to(&mailroom, &alice, &bob).await;
        assert!(first.sent);

        let event = events.try_recv().unwrap();
        assert_eq!(event.to, bob.identity.user_id());
        assert_eq!(live.try_recv().unwrap(), "1");

        let inbox = fetch(&mailroom, &bob).await;
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].key, event.key);
        assert!(inbox[0].key < inbox[1].key);
        assert_eq!(inbox[0].data.from, alice.identity.user_id());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let bob = hello(&mailroom).await;
        send_to(&mailroom, &alice, &bob).await;

        let inbox = fetch(&mailroom, &bob).await;
        let request = AcknowledgeRequest {
            token: bob.user.clone(),
            ids: vec![inbox[0].key.clone()],
        };
        for _ in 0..2 {
            let envelope = sealed(&mailroom, &bob, &request).await;
            assert!(mailroom.acknowledge(&envelope).await.unwrap().deleted);
        }
        assert!(fetch(&mailroom, &bob).await.is_empty());
    }

    #[tokio::test]
    async fn test_request_with_someone_elses_token_is_unauthorized() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let bob = hello(&mailroom).await;

        let request = MessagesRequest {
            token: alice.user.clone(),
            ..Default::default()
        };
        let envelope = sealed(&mailroom, &bob, &request).await;
        assert!(matches!(
            mailroom.messages(&envelope).await,
            Err(ServerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_delete_me_removes_inbox_and_card() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;

        let request = DeleteMeRequest {
            delete: true,
            token: alice.user.clone(),
        };
        let envelope = sealed(&mailroom, &alice, &request).await;
        mailroom.delete_me(&envelope).await.unwrap();
        assert!(mailroom
            .lookup_card(&alice.identity.user_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_push_subscription_is_used_after_restamp() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;
        let bob = hello(&mailroom).await;

        let subscription = PushSubscription {
            endpoint: "https://push.example/bob".into(),
            keys: PushKeys {
                auth: "bob-auth".into(),
                p256dh: "key".into(),
            },
        };
        mailroom
            .subscribe(&SubscribeRequest {
                subscription: subscription.clone(),
                token: bob.anon.clone(),
            })
            .await
            .unwrap();

        let request = MessagesRequest {
            token: bob.user.clone(),
            sub: Some("bob-auth".into()),
            ..Default::default()
        };
        mailroom
            .messages(&sealed(&mailroom, &bob, &request).await)
            .await
            .unwrap();
        let record: InboxRecord = mailroom
            .store
            .get_as(&mailroom.user_path(&bob.identity.user_id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sub.as_deref(), Some("bob-auth"));

        assert!(send_to(&mailroom, &alice, &bob).await.sent);

        mailroom
            .unsubscribe(&SubscribeRequest {
                subscription,
                token: bob.anon.clone(),
            })
            .await
            .unwrap();
        assert!(mailroom
            .store
            .get(&mailroom.push_path("bob-auth"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_live_authentication() {
        let mailroom = mailroom();
        let alice = hello(&mailroom).await;

        let bad = LiveAuth {
            id: alice.identity.user_id(),
            token: alice.anon.clone(),
        };
        assert!(mailroom.authenticate_live(&bad).await.is_err());

        let good = LiveAuth {
            id: alice.identity.user_id(),
            token: alice.user.clone(),
        };
        mailroom.authenticate_live(&good).await.unwrap();
        assert_eq!(
            mailroom.live().connection_count(&alice.identity.user_id()).await,
            1
        );
    }
}
