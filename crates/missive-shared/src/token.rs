//! Compact HMAC-signed tokens (`header.payload.signature`).
//!
//! Every segment is base64url without padding. The header is fixed to
//! `{"typ":"JWT","alg":"HS256"}` and the signature is HMAC-SHA256 over the
//! first two encoded segments joined by a dot.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::{b64_decode, b64_encode};
use crate::error::TokenError;

pub type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub typ: String,
    pub alg: String,
}

impl Default for TokenHeader {
    fn default() -> Self {
        Self {
            typ: "JWT".into(),
            alg: "HS256".into(),
        }
    }
}

/// Token payload. Times are Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// A user id or [`crate::constants::ANONYMOUS`]
    pub sub: String,
    /// Hex user id of the issuing server
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// `iat <= now <= exp`
    pub fn is_live(&self, now: i64) -> bool {
        self.iat <= now && now <= self.exp
    }
}

pub fn hmac_sign(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| TokenError::Secret)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time signature check
pub fn hmac_verify(secret: &[u8], signature: &[u8], data: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

pub fn encode(secret: &[u8], claims: &Claims) -> Result<String, TokenError> {
    let header = b64_encode(&serde_json::to_vec(&TokenHeader::default())?);
    let payload = b64_encode(&serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");
    let signature = hmac_sign(secret, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", b64_encode(&signature)))
}

/// Verify the signature and return the claims. Expiry is left to the caller.
pub fn verify(secret: &[u8], token: &str) -> Result<Claims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = segments.as_slice() else {
        return Err(TokenError::Segments);
    };

    let signature = b64_decode(signature).map_err(|_| TokenError::Encoding)?;
    let signing_input = format!("{header}.{payload}");
    if !hmac_verify(secret, &signature, signing_input.as_bytes()) {
        return Err(TokenError::Signature);
    }

    let header: TokenHeader =
        serde_json::from_slice(&b64_decode(header).map_err(|_| TokenError::Encoding)?)?;
    if header != TokenHeader::default() {
        return Err(TokenError::Header);
    }
    let claims = serde_json::from_slice(&b64_decode(payload).map_err(|_| TokenError::Encoding)?)?;
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            sub: "ANONYMOUS".into(),
            iss: "ab".repeat(32),
            iat: 100,
            exp: 200,
        }
    }

    #[test]
    fn test_encode_verify_roundtrip() {
        let token = encode(b"secret", &claims()).unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert!(!token.contains('='));
        assert_eq!(verify(b"secret", &token).unwrap(), claims());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let token = encode(b"secret", &claims()).unwrap();
        assert!(matches!(verify(b"other", &token), Err(TokenError::Signature)));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let token = encode(b"secret", &claims()).unwrap();
        let mut forged = claims();
        forged.exp = i64::MAX;
        let forged_payload = b64_encode(&serde_json::to_vec(&forged).unwrap());
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert!(verify(b"secret", &tampered).is_err());
    }

    #[test]
    fn test_segment_count() {
        assert!(matches!(verify(b"s", "a.b"), Err(TokenError::Segments)));
        assert!(matches!(verify(b"s", "a.b.c.d"), Err(TokenError::Segments)));
    }

    #[test]
    fn test_claims_window() {
        let c = claims();
        assert!(c.is_live(100));
        assert!(c.is_live(200));
        assert!(!c.is_live(99));
        assert!(!c.is_live(201));
    }
}
