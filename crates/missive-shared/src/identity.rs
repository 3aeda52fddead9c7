use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::KDF_CONTEXT_ENVELOPE;
use crate::crypto::{b64_decode, b64_encode, decrypt, derive_key, encrypt, key_from_hex};
use crate::envelope::{Envelope, Opened};
use crate::error::{CryptoError, IdentityError, SessionError};
use crate::prekey::{Card, Prekey};
use crate::session::{derive_root, Session, SessionInit, SessionState};
use crate::types::UserId;

/// A user's long-term X25519 identity.
/// The public key serves as the user ID.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

/// Serializable format for storing/exporting identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: String,
    pub public_key: String,
}

fn agree(secret: &StaticSecret, public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKey);
    }
    Ok(*shared.as_bytes())
}

fn envelope_key(
    ephemeral_dh: &[u8; 32],
    static_dh: &[u8; 32],
    ephemeral: &[u8; 32],
    from: &UserId,
    to: &UserId,
) -> [u8; 32] {
    derive_key(
        KDF_CONTEXT_ENVELOPE,
        &[ephemeral_dh, static_dh, ephemeral, &from.0, &to.0],
    )
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(*secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore identity from a serialized export
    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let secret = key_from_hex(&export.secret_key).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let identity = Self::from_secret_bytes(&secret);
        if identity.user_id().to_hex() != export.public_key {
            return Err(IdentityError::Blob(
                "public key does not match secret key".into(),
            ));
        }
        Ok(identity)
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: hex::encode(self.secret.to_bytes()),
            public_key: hex::encode(self.public.as_bytes()),
        }
    }

    /// Get the user ID (public key)
    pub fn user_id(&self) -> UserId {
        UserId(self.public.to_bytes())
    }

    pub fn create_prekey(&self) -> Prekey {
        Prekey::generate()
    }

    /// Start a session as initiator from a peer's published card
    pub fn create_session(&self, card: &Card) -> Result<Session, SessionError> {
        let opk = key_from_hex(&card.opk.key)?;
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let init = SessionInit {
            from: self.user_id(),
            ephemeral: hex::encode(ephemeral_public.as_bytes()),
            opk: card.opk.id.clone(),
        };
        let ephemeral_dh = agree(&ephemeral, &opk)?;
        let identity_dh = agree(&self.secret, &card.user.0)?;
        let root = derive_root(&ephemeral_dh, &identity_dh, &init, &card.user);

        Ok(Session::from_root(card.user, &root, true, Some(init)))
    }

    /// Accept a peer's initiation using the prekey it was built against
    pub fn open_session(&self, init: &SessionInit, prekey: &Prekey) -> Result<Session, SessionError> {
        if init.opk != prekey.id {
            return Err(SessionError::PrekeyMismatch(init.opk.clone()));
        }
        let ephemeral = key_from_hex(&init.ephemeral)?;
        let ephemeral_dh = agree(&prekey.secret()?, &ephemeral)?;
        let identity_dh = agree(&self.secret, &init.from.0)?;
        let root = derive_root(&ephemeral_dh, &identity_dh, init, &self.user_id());

        Ok(Session::from_root(init.from, &root, false, None))
    }

    pub fn load_session(&self, state: SessionState) -> Result<Session, SessionError> {
        Session::load(state)
    }

    /// Encrypt `payload` so that only `to` can open it and can tell it came from us
    pub fn seal_envelope<T: Serialize>(&self, to: &UserId, payload: &T) -> Result<Envelope, CryptoError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let from = self.user_id();

        let key = envelope_key(
            &agree(&ephemeral, &to.0)?,
            &agree(&self.secret, &to.0)?,
            ephemeral_public.as_bytes(),
            &from,
            to,
        );
        let plaintext = serde_json::to_vec(payload)?;
        let ciphertext = encrypt(&key, &plaintext)?;

        Ok(Envelope {
            to: *to,
            from,
            ephemeral: hex::encode(ephemeral_public.as_bytes()),
            ciphertext: b64_encode(&ciphertext),
        })
    }

    pub fn open_envelope<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<Opened<T>, CryptoError> {
        if envelope.to != self.user_id() {
            return Err(CryptoError::WrongRecipient);
        }
        let ephemeral = key_from_hex(&envelope.ephemeral)?;
        let key = envelope_key(
            &agree(&self.secret, &ephemeral)?,
            &agree(&self.secret, &envelope.from.0)?,
            &ephemeral,
            &envelope.from,
            &envelope.to,
        );
        let plaintext = decrypt(&key, &b64_decode(&envelope.ciphertext)?)?;

        Ok(Opened {
            from: envelope.from,
            plaintext: serde_json::from_slice(&plaintext)?,
        })
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}
