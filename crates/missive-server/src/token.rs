//! Issues and validates the short-lived tokens that authenticate requests.

use missive_shared::constants::ANONYMOUS;
use missive_shared::error::TokenError;
use missive_shared::token::{self, Claims};
use missive_shared::types::{now_secs, UserId};
use tracing::debug;

/// Signs tokens with the process-wide secret on behalf of the server identity.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    issuer: UserId,
    ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: Vec<u8>, issuer: UserId, ttl_secs: i64) -> Self {
        Self {
            secret,
            issuer,
            ttl_secs,
        }
    }

    /// Issue a token for `subject` with the configured lifetime.
    pub fn issue(&self, subject: &str) -> Result<(String, Claims), TokenError> {
        self.issue_with_ttl(subject, self.ttl_secs)
    }

    pub fn issue_anonymous(&self) -> Result<(String, Claims), TokenError> {
        self.issue(ANONYMOUS)
    }

    pub fn issue_with_ttl(&self, subject: &str, ttl_secs: i64) -> Result<(String, Claims), TokenError> {
        let iat = now_secs();
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.to_hex(),
            iat,
            exp: iat + ttl_secs,
        };
        let token = token::encode(&self.secret, &claims)?;
        Ok((token, claims))
    }

    /// `true` only for a well-formed token signed by us, issued to
    /// `expected_subject` and inside its validity window.
    pub fn validate(&self, token: &str, expected_subject: &str) -> bool {
        let claims = match token::verify(&self.secret, token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "Rejecting token");
                return false;
            }
        };
        if claims.sub != expected_subject {
            debug!(sub = %claims.sub, expected = %expected_subject, "Token subject mismatch");
            return false;
        }
        if !claims.is_live(now_secs()) {
            debug!(iat = claims.iat, exp = claims.exp, "Token outside validity window");
            return false;
        }
        true
    }

    pub fn validate_anonymous(&self, token: &str) -> bool {
        self.validate(token, ANONYMOUS)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"0123456789abcdef".to_vec(), UserId([3; 32]), 1800)
    }

    #[test]
    fn test_issue_then_validate() {
        let tokens = service();
        let (token, claims) = tokens.issue("alice").unwrap();
        assert!(tokens.validate(&token, "alice"));
        assert_eq!(claims.exp - claims.iat, 1800);
        assert_eq!(claims.iss, UserId([3; 32]).to_hex());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let tokens = service();
        let (token, _) = tokens.issue_with_ttl("alice", -1).unwrap();
        assert!(!tokens.validate(&token, "alice"));
    }

    #[test]
    fn test_other_subject_is_rejected() {
        let tokens = service();
        let (token, _) = tokens.issue("alice").unwrap();
        assert!(!tokens.validate(&token, "bob"));
        assert!(!tokens.validate_anonymous(&token));
    }

    #[test]
    fn test_future_token_is_rejected() {
        let tokens = service();
        let claims = Claims {
            sub: ANONYMOUS.into(),
            iss: UserId([3; 32]).to_hex(),
            iat: now_secs() + 600,
            exp: now_secs() + 1200,
        };
        let token = token::encode(b"0123456789abcdef", &claims).unwrap();
        assert!(!tokens.validate_anonymous(&token));
    }

    #[test]
    fn test_foreign_secret_and_garbage_are_rejected() {
        let tokens = service();
        let other = TokenService::new(b"another secret".to_vec(), UserId([3; 32]), 1800);
        let (token, _) = other.issue_anonymous().unwrap();
        assert!(!tokens.validate_anonymous(&token));
        assert!(!tokens.validate_anonymous("not-a-token"));
        assert!(!tokens.validate_anonymous(""));
    }
}
