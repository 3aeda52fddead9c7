//! Envelope gateway shared by client and server.
//!
//! Everything a client sends to the server beyond `hello`, `card` and the
//! push routes travels sealed to the server identity, and every stored
//! message is sealed from one user to another. The gateway is the only
//! place that turns envelopes into typed payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::session::SessionWire;
use crate::types::UserId;

/// Encrypted container addressed to one identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub to: UserId,
    pub from: UserId,
    /// Hex-encoded per-envelope X25519 public key
    pub ephemeral: String,
    /// base64url(nonce || ciphertext)
    pub ciphertext: String,
}

/// An opened envelope: the authenticated sender and its payload.
#[derive(Debug, Clone)]
pub struct Opened<T> {
    pub from: UserId,
    pub plaintext: T,
}

pub fn seal<T: Serialize>(identity: &Identity, to: &UserId, payload: &T) -> Result<Envelope, CryptoError> {
    identity.seal_envelope(to, payload)
}

pub fn open<T: DeserializeOwned>(identity: &Identity, envelope: &Envelope) -> Result<Opened<T>, CryptoError> {
    identity.open_envelope(envelope)
}

/// Open a user-to-user envelope carrying a session message.
///
/// Returns `None` when the envelope does not open or when the initiation it
/// carries claims a sender other than the envelope's.
pub fn open_message(identity: &Identity, envelope: &Envelope) -> Option<Opened<SessionWire>> {
    let opened: Opened<SessionWire> = match open(identity, envelope) {
        Ok(opened) => opened,
        Err(e) => {
            tracing::debug!(from = %envelope.from.short(), error = %e, "Dropping unopenable envelope");
            return None;
        }
    };
    if let Some(init) = &opened.plaintext.init {
        if init.from != opened.from {
            tracing::warn!(
                from = %opened.from.short(),
                claimed = %init.from.short(),
                "Initiation claims a different sender"
            );
            return None;
        }
    }
    Some(opened)
}
