//! Per-contact ratchet sessions: the read path with stale recovery and the
//! reset protocol, and the send path.
//!
//! Reads and sends for one contact are serialized by a per-contact mutex.
//! Every read attempt works on a copy of the stored state; nothing is
//! written back until one attempt succeeds. Inbox entries may be delivered
//! more than once; a repeat is dropped without touching the sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use missive_shared::envelope::{self, Envelope};
use missive_shared::error::SessionError;
use missive_shared::protocol::{timestamp_from_key, Control, Payload, SendResponse};
use missive_shared::session::{Session, SessionState, SessionWire};
use missive_shared::types::{now_millis, UserId};
use missive_store::{StoreExt, StorePath};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::ServerApi;
use crate::contacts::{ContactRegistry, MessageRecord, MessageStatus, Profile};
use crate::context::ClientContext;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::prekey::PrekeyManager;

pub struct SessionManager {
    ctx: Arc<ClientContext>,
    api: Arc<ServerApi>,
    prekeys: Arc<PrekeyManager>,
    contacts: Arc<ContactRegistry>,
    locks: StdMutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

enum Attempt {
    Read(Session, Payload),
    /// The session already consumed this message number
    Replayed,
    Failed,
}

enum ReadOutcome {
    Payload(Payload),
    Duplicate,
    Unreadable,
}

/// Read `wire` with a copy of `state`, returning the advanced session.
fn try_read(state: SessionState, wire: &SessionWire) -> Attempt {
    let mut session = match Session::load(state) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable session state");
            return Attempt::Failed;
        }
    };
    match session.read::<Payload>(wire) {
        Ok(payload) => Attempt::Read(session, payload),
        Err(SessionError::Replayed(n)) => {
            debug!(n, "Session already read message");
            Attempt::Replayed
        }
        Err(e) => {
            debug!(n = wire.n, error = %e, "Session could not read message");
            Attempt::Failed
        }
    }
}

impl SessionManager {
    pub fn new(
        ctx: Arc<ClientContext>,
        api: Arc<ServerApi>,
        prekeys: Arc<PrekeyManager>,
        contacts: Arc<ContactRegistry>,
    ) -> Self {
        Self {
            ctx,
            api,
            prekeys,
            contacts,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, peer: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(*peer).or_default().clone()
    }

    /// Forget the lock of `peer` once no other task holds or waits on it.
    fn release(&self, peer: &UserId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // clones only happen under `locks`: two owners are the map and us
        if Arc::strong_count(&lock) == 2 {
            locks.remove(peer);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn load_state(&self, path: &StorePath) -> Result<Option<SessionState>, ClientError> {
        Ok(self.ctx.store.get_as(path).await?)
    }

    async fn save(&self, path: &StorePath, session: &Session) -> Result<(), ClientError> {
        self.ctx.store.put_as(path, &session.save()).await?;
        Ok(())
    }

    /// Open and decrypt one inbox entry.
    ///
    /// Returns the stored record for a user message, `None` for anything that
    /// produced no message: undecryptable or spoofed envelopes, blocked
    /// senders, repeated entries, control messages and desynchronized
    /// sessions (which trigger a reset toward the sender).
    pub async fn read(&self, key: &str, envelope: &Envelope) -> Result<Option<MessageRecord>, ClientError> {
        let identity = self.ctx.identity().await?;
        let Some(opened) = envelope::open_message(identity, envelope) else {
            return Ok(None);
        };
        let peer = opened.from;

        if self.contacts.is_blocked(&peer).await? {
            debug!(from = %peer.short(), "Dropping message from blocked contact");
            return Ok(None);
        }

        let lock = self.lock_for(&peer);
        let result = {
            let _guard = lock.lock().await;
            self.read_entry_locked(&peer, key, &opened.plaintext).await
        };
        self.release(&peer, lock);
        result
    }

    async fn read_entry_locked(
        &self,
        peer: &UserId,
        key: &str,
        wire: &SessionWire,
    ) -> Result<Option<MessageRecord>, ClientError> {
        if self.contacts.has_message(peer, key).await? {
            debug!(from = %peer.short(), key, "Skipping message already stored");
            return Ok(None);
        }

        let payload = match self.read_locked(peer, wire).await? {
            ReadOutcome::Payload(payload) => payload,
            ReadOutcome::Duplicate => {
                debug!(from = %peer.short(), key, "Skipping repeated message");
                return Ok(None);
            }
            ReadOutcome::Unreadable => {
                warn!(from = %peer.short(), "No session could read message, resetting");
                self.reset_locked(peer).await?;
                return Ok(None);
            }
        };

        match payload {
            Payload::Control(Control::Reset) => {
                info!(from = %peer.short(), "Peer reset our session");
                self.clear_locked(peer).await?;
                Ok(None)
            }
            Payload::Message(plaintext) => {
                let record = MessageRecord {
                    to: self.ctx.user_id().await?,
                    from: *peer,
                    plaintext,
                    timestamp: timestamp_from_key(key).unwrap_or_else(now_millis),
                    status: MessageStatus::Received,
                };
                self.contacts.record_message(peer, key, &record).await?;
                self.contacts.upsert(peer, Profile::default(), true).await?;
                self.ctx.events.emit(ClientEvent::MessageSaved {
                    contact: *peer,
                    key: key.to_string(),
                    message: record.clone(),
                });
                Ok(Some(record))
            }
        }
    }

    async fn read_locked(&self, peer: &UserId, wire: &SessionWire) -> Result<ReadOutcome, ClientError> {
        let identity = self.ctx.identity().await?;
        let session_path = self.ctx.session_path(peer);
        let stale_path = self.ctx.stale_path(peer);
        let stored = self.load_state(&session_path).await?;
        let mut replayed = false;

        if let Some(state) = stored.clone() {
            match try_read(state, wire) {
                Attempt::Read(session, payload) => {
                    self.save(&session_path, &session).await?;
                    return Ok(ReadOutcome::Payload(payload));
                }
                Attempt::Replayed => replayed = true,
                Attempt::Failed => {}
            }
        }

        if let Some(init) = &wire.init {
            let Some(prekey) = self.prekeys.find(&init.opk).await? else {
                debug!(from = %peer.short(), opk = %init.opk, "Initiation against unknown prekey");
                // already applied before the prekey rotated
                return Ok(if replayed {
                    ReadOutcome::Duplicate
                } else {
                    ReadOutcome::Unreadable
                });
            };
            let mut session = match identity.open_session(init, &prekey) {
                Ok(session) => session,
                Err(e) => {
                    debug!(from = %peer.short(), error = %e, "Could not open initiation");
                    return Ok(ReadOutcome::Unreadable);
                }
            };
            let payload = match session.read::<Payload>(wire) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(from = %peer.short(), error = %e, "Fresh session could not read message");
                    return Ok(ReadOutcome::Unreadable);
                }
            };

            if let Some(previous) = &stored {
                self.ctx.store.put_as(&stale_path, previous).await?;
            }
            self.save(&session_path, &session).await?;
            self.prekeys.consume(&init.opk).await?;
            info!(from = %peer.short(), opk = %init.opk, "Accepted new session");
            return Ok(ReadOutcome::Payload(payload));
        }

        if let Some(state) = self.load_state(&stale_path).await? {
            match try_read(state, wire) {
                Attempt::Read(session, payload) => {
                    debug!(from = %peer.short(), "Read message with stale session");
                    self.save(&stale_path, &session).await?;
                    return Ok(ReadOutcome::Payload(payload));
                }
                Attempt::Replayed => replayed = true,
                Attempt::Failed => {}
            }
        }

        // a new session always carries its initiation, so a number one of
        // our sessions already consumed is a repeat, not a desync
        Ok(if replayed {
            ReadOutcome::Duplicate
        } else {
            ReadOutcome::Unreadable
        })
    }

    /// Encrypt `payload` for `peer` and post it, creating a session from the
    /// peer's card when there is none.
    pub async fn send(&self, peer: &UserId, payload: &Payload) -> Result<SendResponse, ClientError> {
        let lock = self.lock_for(peer);
        let result = {
            let _guard = lock.lock().await;
            self.send_locked(peer, payload).await
        };
        self.release(peer, lock);
        result
    }

    async fn send_locked(&self, peer: &UserId, payload: &Payload) -> Result<SendResponse, ClientError> {
        let identity = self.ctx.identity().await?;
        let path = self.ctx.session_path(peer);

        let mut session = match self.load_state(&path).await? {
            Some(state) => identity.load_session(state)?,
            None => {
                let card = self
                    .api
                    .card(peer)
                    .await?
                    .ok_or(ClientError::CardNotFound(*peer))?;
                let session = identity.create_session(&card)?;
                self.save(&path, &session).await?;
                debug!(to = %peer.short(), opk = %card.opk.id, "Created session");
                session
            }
        };

        let wire = session.send(payload)?;
        let sealed = envelope::seal(identity, peer, &wire)?;
        let sent = self.api.send(sealed).await?;
        self.save(&path, &session).await?;
        Ok(sent)
    }

    /// Drop our sessions with `peer` and ask it to start over.
    pub async fn reset(&self, peer: &UserId) -> Result<(), ClientError> {
        let lock = self.lock_for(peer);
        let result = {
            let _guard = lock.lock().await;
            self.reset_locked(peer).await
        };
        self.release(peer, lock);
        result
    }

    async fn reset_locked(&self, peer: &UserId) -> Result<(), ClientError> {
        self.clear_locked(peer).await?;
        if let Err(e) = self.send_locked(peer, &Payload::Control(Control::Reset)).await {
            warn!(to = %peer.short(), error = %e, "Failed to send reset notice");
        }
        Ok(())
    }

    /// Drop the current and stale sessions with `peer`.
    pub async fn clear(&self, peer: &UserId) -> Result<(), ClientError> {
        let lock = self.lock_for(peer);
        let result = {
            let _guard = lock.lock().await;
            self.clear_locked(peer).await
        };
        self.release(peer, lock);
        result
    }

    async fn clear_locked(&self, peer: &UserId) -> Result<(), ClientError> {
        self.ctx.store.del(&self.ctx.session_path(peer)).await?;
        self.ctx.store.del(&self.ctx.stale_path(peer)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use missive_shared::identity::Identity;
    use missive_shared::prekey::Card;
    use missive_shared::protocol::inbox_key;
    use missive_store::MemoryStore;
    use serde_json::{json, Value};

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn post(&self, _method: &str, _body: Value) -> Result<Value, ClientError> {
            Err(ClientError::Transport("offline".into()))
        }
    }

    struct Harness {
        ctx: Arc<ClientContext>,
        prekeys: Arc<PrekeyManager>,
        contacts: Arc<ContactRegistry>,
        sessions: SessionManager,
    }

    fn harness() -> Harness {
        let ctx = Arc::new(ClientContext::new(
            ClientConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Offline),
        ));
        let prekeys = Arc::new(PrekeyManager::new(ctx.clone()));
        let api = Arc::new(ServerApi::new(ctx.clone(), prekeys.clone()));
        let contacts = Arc::new(ContactRegistry::new(ctx.clone()));
        let sessions = SessionManager::new(ctx.clone(), api, prekeys.clone(), contacts.clone());
        Harness {
            ctx,
            prekeys,
            contacts,
            sessions,
        }
    }

    impl Harness {
        async fn card(&self) -> Card {
            Card {
                user: self.ctx.user_id().await.unwrap(),
                opk: self.prekeys.current().await.unwrap().one_time_key(),
            }
        }

        /// Answer `peer` on the stored session, as a send would.
        async fn reply(&self, peer: &UserId, payload: &Payload) -> SessionWire {
            let path = self.ctx.session_path(peer);
            let state: SessionState = self.ctx.store.get_as(&path).await.unwrap().unwrap();
            let mut session = Session::load(state).unwrap();
            let wire = session.send(payload).unwrap();
            self.ctx.store.put_as(&path, &session.save()).await.unwrap();
            wire
        }
    }

    fn seal(from: &Identity, to: &UserId, wire: &SessionWire) -> Envelope {
        envelope::seal(from, to, wire).unwrap()
    }

    fn message(n: i64) -> Payload {
        Payload::Message(json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_init_opens_session_and_consumes_prekey() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let wire = outbound.send(&message(1)).unwrap();
        let key = inbox_key(1_700_000_000_000);

        let record = alice
            .sessions
            .read(&key, &seal(&bob, &alice_id, &wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.plaintext, json!({ "n": 1 }));
        assert_eq!(record.from, bob.user_id());
        assert_eq!(record.timestamp, 1_700_000_000_000);
        assert_eq!(record.status, MessageStatus::Received);

        assert!(alice.prekeys.is_used().await.unwrap());
        let contact = alice.contacts.get(&bob.user_id()).await.unwrap().unwrap();
        assert!(contact.unread);
        let history = alice.contacts.list_messages(&bob.user_id(), None).await.unwrap();
        assert_eq!(history, vec![(key, record)]);
    }

    #[tokio::test]
    async fn test_stale_session_reads_late_message() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();
        let card = alice.card().await;

        let mut first = bob.create_session(&card).unwrap();
        let m1 = first.send(&message(1)).unwrap();
        alice.sessions.read(&inbox_key(1), &seal(&bob, &alice_id, &m1)).await.unwrap().unwrap();

        // once bob reads an answer, the first session stops sending its initiation
        let answer = alice.reply(&bob.user_id(), &message(10)).await;
        assert_eq!(first.read::<Payload>(&answer).unwrap(), message(10));
        let late = first.send(&message(2)).unwrap();
        assert!(late.init.is_none());

        // bob starts over; alice snapshots the first session as stale
        let mut second = bob.create_session(&card).unwrap();
        let m3 = second.send(&message(3)).unwrap();
        alice.sessions.read(&inbox_key(3), &seal(&bob, &alice_id, &m3)).await.unwrap().unwrap();

        let record = alice
            .sessions
            .read(&inbox_key(2), &seal(&bob, &alice_id, &late))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.plaintext, json!({ "n": 2 }));

        // the current session is still the second one
        let m4 = second.send(&message(4)).unwrap();
        let record = alice
            .sessions
            .read(&inbox_key(4), &seal(&bob, &alice_id, &m4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.plaintext, json!({ "n": 4 }));
    }

    #[tokio::test]
    async fn test_repeated_entry_keeps_session() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();
        let session_path = alice.ctx.session_path(&bob.user_id());

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let m1 = seal(&bob, &alice_id, &outbound.send(&message(1)).unwrap());
        let k1 = inbox_key(1);
        alice.sessions.read(&k1, &m1).await.unwrap().unwrap();
        let after_first = alice.ctx.store.get(&session_path).await.unwrap();

        assert!(alice.sessions.read(&k1, &m1).await.unwrap().is_none());
        assert_eq!(alice.ctx.store.get(&session_path).await.unwrap(), after_first);

        let m2 = outbound.send(&message(2)).unwrap();
        let record = alice
            .sessions
            .read(&inbox_key(2), &seal(&bob, &alice_id, &m2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.plaintext, json!({ "n": 2 }));
        assert_eq!(alice.contacts.list_messages(&bob.user_id(), None).await.unwrap().len(), 2);
        assert_eq!(alice.sessions.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_replayed_number_is_not_a_desync() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();
        let session_path = alice.ctx.session_path(&bob.user_id());

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let m1 = outbound.send(&message(1)).unwrap();
        alice.sessions.read(&inbox_key(1), &seal(&bob, &alice_id, &m1)).await.unwrap().unwrap();
        let answer = alice.reply(&bob.user_id(), &message(10)).await;
        outbound.read::<Payload>(&answer).unwrap();

        let m2 = seal(&bob, &alice_id, &outbound.send(&message(2)).unwrap());
        alice.sessions.read(&inbox_key(2), &m2).await.unwrap().unwrap();

        // the history no longer has the entry, but the session already read it
        alice.contacts.clear(&bob.user_id()).await.unwrap();
        assert!(alice.sessions.read(&inbox_key(2), &m2).await.unwrap().is_none());
        assert!(alice.ctx.store.get(&session_path).await.unwrap().is_some());

        let m3 = outbound.send(&message(3)).unwrap();
        let record = alice
            .sessions
            .read(&inbox_key(3), &seal(&bob, &alice_id, &m3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.plaintext, json!({ "n": 3 }));
    }

    #[tokio::test]
    async fn test_contact_locks_are_released() {
        let alice = harness();
        let peer = UserId([7; 32]);

        let (a, b) = tokio::join!(alice.sessions.clear(&peer), alice.sessions.clear(&peer));
        a.unwrap();
        b.unwrap();
        assert_eq!(alice.sessions.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_notice_clears_sessions() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let m1 = outbound.send(&message(1)).unwrap();
        alice.sessions.read(&inbox_key(1), &seal(&bob, &alice_id, &m1)).await.unwrap();
        assert!(alice.ctx.store.get(&alice.ctx.session_path(&bob.user_id())).await.unwrap().is_some());

        let reset = outbound.send(&Payload::Control(Control::Reset)).unwrap();
        let read = alice
            .sessions
            .read(&inbox_key(2), &seal(&bob, &alice_id, &reset))
            .await
            .unwrap();
        assert!(read.is_none());

        let store = &alice.ctx.store;
        assert!(store.get(&alice.ctx.session_path(&bob.user_id())).await.unwrap().is_none());
        assert!(store.get(&alice.ctx.stale_path(&bob.user_id())).await.unwrap().is_none());
        assert_eq!(alice.contacts.list_messages(&bob.user_id(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_sender_is_dropped() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();
        alice.contacts.block(&bob.user_id(), true).await.unwrap();

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let wire = outbound.send(&message(1)).unwrap();
        let read = alice
            .sessions
            .read(&inbox_key(1), &seal(&bob, &alice_id, &wire))
            .await
            .unwrap();

        assert!(read.is_none());
        assert!(!alice.prekeys.is_used().await.unwrap());
        assert!(alice.contacts.list_messages(&bob.user_id(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_initiation_is_dropped() {
        let alice = harness();
        let alice_id = alice.ctx.user_id().await.unwrap();
        let bob = Identity::generate();
        let mallory = Identity::generate();

        let mut outbound = bob.create_session(&alice.card().await).unwrap();
        let wire = outbound.send(&message(1)).unwrap();
        let read = alice
            .sessions
            .read(&inbox_key(1), &seal(&mallory, &alice_id, &wire))
            .await
            .unwrap();

        assert!(read.is_none());
        assert!(alice.contacts.get(&mallory.user_id()).await.unwrap().is_none());
    }
}
