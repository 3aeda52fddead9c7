//! Per-contact ratchet state.
//!
//! A session is seeded from a root key agreed through a prekey initiation
//! (see [`crate::identity::Identity::create_session`] and
//! [`crate::identity::Identity::open_session`]). From the root two symmetric
//! hash chains are derived, one per direction. Every send and every
//! successful read advances its chain, so the serialized state must be
//! persisted after each of them.
//!
//! Reads are transactional: the state is only updated once the ciphertext
//! authenticates and the payload parses.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{
    KDF_CONTEXT_CHAIN_INITIATOR, KDF_CONTEXT_CHAIN_RESPONDER, KDF_CONTEXT_CHAIN_STEP,
    KDF_CONTEXT_MESSAGE_KEY, KDF_CONTEXT_ROOT, MAX_SKIPPED_KEYS,
};
use crate::crypto::{b64_decode, b64_encode, decrypt, derive_key, encrypt, key_from_hex};
use crate::error::{CryptoError, SessionError};
use crate::types::UserId;

/// Attached to every message of an initiating session until the peer answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInit {
    /// Initiator's identity; must equal the envelope sender
    pub from: UserId,
    /// Hex-encoded ephemeral X25519 public key
    pub ephemeral: String,
    /// Id of the responder's prekey the initiation was built against
    pub opk: String,
}

/// What a session produces on send and consumes on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<SessionInit>,
    pub n: u32,
    pub ciphertext: String,
}

impl SessionWire {
    pub fn is_init(&self) -> bool {
        self.init.is_some()
    }
}

/// Serialized form of a [`Session`], the blob kept in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub peer: UserId,
    pub send_chain: String,
    pub send_n: u32,
    pub recv_chain: String,
    pub recv_n: u32,
    #[serde(default)]
    pub skipped: BTreeMap<u32, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_init: Option<SessionInit>,
}

#[derive(Clone)]
pub struct Session {
    peer: UserId,
    send_chain: [u8; 32],
    send_n: u32,
    recv_chain: [u8; 32],
    recv_n: u32,
    skipped: BTreeMap<u32, [u8; 32]>,
    pending_init: Option<SessionInit>,
}

/// Root key shared by both ends of an initiation.
pub(crate) fn derive_root(
    ephemeral_dh: &[u8; 32],
    identity_dh: &[u8; 32],
    init: &SessionInit,
    responder: &UserId,
) -> [u8; 32] {
    derive_key(
        KDF_CONTEXT_ROOT,
        &[
            ephemeral_dh,
            identity_dh,
            init.ephemeral.as_bytes(),
            &init.from.0,
            &responder.0,
            init.opk.as_bytes(),
        ],
    )
}

fn message_key(chain: &[u8; 32]) -> [u8; 32] {
    derive_key(KDF_CONTEXT_MESSAGE_KEY, &[chain])
}

fn step(chain: &[u8; 32]) -> [u8; 32] {
    derive_key(KDF_CONTEXT_CHAIN_STEP, &[chain])
}

impl Session {
    pub(crate) fn from_root(
        peer: UserId,
        root: &[u8; 32],
        initiator: bool,
        pending_init: Option<SessionInit>,
    ) -> Self {
        let initiator_chain = derive_key(KDF_CONTEXT_CHAIN_INITIATOR, &[root]);
        let responder_chain = derive_key(KDF_CONTEXT_CHAIN_RESPONDER, &[root]);
        let (send_chain, recv_chain) = if initiator {
            (initiator_chain, responder_chain)
        } else {
            (responder_chain, initiator_chain)
        };
        Self {
            peer,
            send_chain,
            send_n: 0,
            recv_chain,
            recv_n: 0,
            skipped: BTreeMap::new(),
            pending_init,
        }
    }

    pub fn load(state: SessionState) -> Result<Self, SessionError> {
        let malformed = |e: CryptoError| SessionError::Malformed(e.to_string());
        let mut skipped = BTreeMap::new();
        for (n, key) in state.skipped {
            skipped.insert(n, key_from_hex(&key).map_err(malformed)?);
        }
        Ok(Self {
            peer: state.peer,
            send_chain: key_from_hex(&state.send_chain).map_err(malformed)?,
            send_n: state.send_n,
            recv_chain: key_from_hex(&state.recv_chain).map_err(malformed)?,
            recv_n: state.recv_n,
            skipped,
            pending_init: state.pending_init,
        })
    }

    pub fn save(&self) -> SessionState {
        SessionState {
            peer: self.peer,
            send_chain: hex::encode(self.send_chain),
            send_n: self.send_n,
            recv_chain: hex::encode(self.recv_chain),
            recv_n: self.recv_n,
            skipped: self
                .skipped
                .iter()
                .map(|(n, key)| (*n, hex::encode(key)))
                .collect(),
            pending_init: self.pending_init.clone(),
        }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    /// The initiation still attached to outgoing messages, if any
    pub fn pending_init(&self) -> Option<&SessionInit> {
        self.pending_init.as_ref()
    }

    pub fn send<T: Serialize>(&mut self, payload: &T) -> Result<SessionWire, SessionError> {
        let plaintext = serde_json::to_vec(payload).map_err(CryptoError::from)?;
        let key = message_key(&self.send_chain);
        let ciphertext = encrypt(&key, &plaintext)?;

        let wire = SessionWire {
            init: self.pending_init.clone(),
            n: self.send_n,
            ciphertext: b64_encode(&ciphertext),
        };
        self.send_chain = step(&self.send_chain);
        self.send_n += 1;
        Ok(wire)
    }

    pub fn read<T: DeserializeOwned>(&mut self, wire: &SessionWire) -> Result<T, SessionError> {
        let mut chain = self.recv_chain;
        let mut n = self.recv_n;
        let mut skipped = self.skipped.clone();

        let key = if wire.n < n {
            skipped.remove(&wire.n).ok_or(SessionError::Replayed(wire.n))?
        } else {
            if wire.n - n > MAX_SKIPPED_KEYS {
                return Err(SessionError::TooFarAhead {
                    expected: n,
                    got: wire.n,
                });
            }
            while n < wire.n {
                skipped.insert(n, message_key(&chain));
                chain = step(&chain);
                n += 1;
            }
            let key = message_key(&chain);
            chain = step(&chain);
            n += 1;
            key
        };

        let ciphertext = b64_decode(&wire.ciphertext)?;
        let plaintext = decrypt(&key, &ciphertext)?;
        let payload: T = serde_json::from_slice(&plaintext).map_err(CryptoError::from)?;

        while skipped.len() > MAX_SKIPPED_KEYS as usize {
            skipped.pop_first();
        }
        self.recv_chain = chain;
        self.recv_n = n;
        self.skipped = skipped;
        // the peer could only have answered if it opened our initiation
        self.pending_init = None;
        Ok(payload)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("send_n", &self.send_n)
            .field("recv_n", &self.recv_n)
            .field("pending_init", &self.pending_init.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn pair() -> (Session, Session) {
        let init = SessionInit {
            from: UserId([1; 32]),
            ephemeral: "ee".repeat(32),
            opk: "0011223344556677".into(),
        };
        let root = [9u8; 32];
        let initiator = Session::from_root(UserId([2; 32]), &root, true, Some(init));
        let responder = Session::from_root(UserId([1; 32]), &root, false, None);
        (initiator, responder)
    }

    #[test]
    fn test_messages_flow_both_ways() {
        let (mut alice, mut bob) = pair();

        let wire = alice.send(&json!({"hi": 1})).unwrap();
        assert!(wire.is_init());
        let read: Value = bob.read(&wire).unwrap();
        assert_eq!(read, json!({"hi": 1}));

        let reply = bob.send(&json!("hello back")).unwrap();
        assert!(!reply.is_init());
        let read: Value = alice.read(&reply).unwrap();
        assert_eq!(read, json!("hello back"));
        assert!(alice.pending_init().is_none());
    }

    #[test]
    fn test_out_of_order_uses_skipped_keys_once() {
        let (mut alice, mut bob) = pair();
        let first = alice.send(&json!(1)).unwrap();
        let second = alice.send(&json!(2)).unwrap();

        assert_eq!(bob.read::<Value>(&second).unwrap(), json!(2));
        assert_eq!(bob.read::<Value>(&first).unwrap(), json!(1));
        assert!(matches!(
            bob.read::<Value>(&first),
            Err(SessionError::Replayed(0))
        ));
    }

    #[test]
    fn test_failed_read_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let mut wire = alice.send(&json!("x")).unwrap();
        let good = wire.clone();
        wire.ciphertext = b64_encode(b"garbage that is long enough to hold a nonce");

        assert!(bob.read::<Value>(&wire).is_err());
        assert_eq!(bob.read::<Value>(&good).unwrap(), json!("x"));
    }

    #[test]
    fn test_save_load_preserves_chains() {
        let (mut alice, bob) = pair();
        let wire = alice.send(&json!("persisted")).unwrap();

        let state = serde_json::to_value(bob.save()).unwrap();
        let mut restored = Session::load(serde_json::from_value(state).unwrap()).unwrap();
        assert_eq!(restored.read::<Value>(&wire).unwrap(), json!("persisted"));
    }

    #[test]
    fn test_rejects_far_future_counter() {
        let (mut alice, mut bob) = pair();
        let mut wire = alice.send(&json!(0)).unwrap();
        wire.n = MAX_SKIPPED_KEYS + 5;
        assert!(matches!(
            bob.read::<Value>(&wire),
            Err(SessionError::TooFarAhead { .. })
        ));
    }
}
