//! One-time prekeys and the public card built from them.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{key_from_hex, random_bytes};
use crate::error::CryptoError;
use crate::types::{now_millis, UserId};

/// Public half of a prekey, as published to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OneTimeKey {
    /// Random identifier, lets the owner match an initiation to its secret
    pub id: String,
    /// Hex-encoded X25519 public key
    pub key: String,
}

/// Everything a peer needs to start a session without prior interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub user: UserId,
    pub opk: OneTimeKey,
}

/// A single-use X25519 key pair.
///
/// `used` flips to `true` the first time a session is opened from it; the
/// owner must rotate before publishing again.
#[derive(Clone, Serialize, Deserialize)]
pub struct Prekey {
    pub id: String,
    secret: String,
    pub public: String,
    #[serde(default)]
    pub used: bool,
    pub created_at: i64,
}

impl Prekey {
    /// Generate a fresh, unused prekey
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            id: hex::encode(random_bytes::<8>()),
            secret: hex::encode(secret.to_bytes()),
            public: hex::encode(public.as_bytes()),
            used: false,
            created_at: now_millis(),
        }
    }

    /// The publishable half
    pub fn one_time_key(&self) -> OneTimeKey {
        OneTimeKey {
            id: self.id.clone(),
            key: self.public.clone(),
        }
    }

    pub(crate) fn secret(&self) -> Result<StaticSecret, CryptoError> {
        Ok(StaticSecret::from(key_from_hex(&self.secret)?))
    }
}

impl std::fmt::Debug for Prekey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prekey")
            .field("id", &self.id)
            .field("public", &self.public)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_prekeys_are_distinct_and_unused() {
        let a = Prekey::generate();
        let b = Prekey::generate();
        assert_ne!(a.id, b.id);
        assert_ne!(a.public, b.public);
        assert!(!a.used);
    }

    #[test]
    fn test_one_time_key_matches_secret() {
        let prekey = Prekey::generate();
        let secret = prekey.secret().unwrap();
        let expected = hex::encode(PublicKey::from(&secret).as_bytes());
        assert_eq!(prekey.one_time_key().key, expected);
    }

    #[test]
    fn test_debug_hides_secret() {
        let prekey = Prekey::generate();
        let rendered = format!("{prekey:?}");
        assert!(!rendered.contains(&prekey.secret));
    }
}
