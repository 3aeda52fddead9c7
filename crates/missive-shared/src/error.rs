use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Key agreement produced a non-contributory secret")]
    WeakKey,

    #[error("Envelope is addressed to another identity")]
    WrongRecipient,

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Identity blob error: {0}")]
    Blob(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Prekey {0} does not match the initiation")]
    PrekeyMismatch(String),

    #[error("Message {0} was already read")]
    Replayed(u32),

    #[error("Message {got} skips too far ahead of {expected}")]
    TooFarAhead { expected: u32, got: u32 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed session state: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token must have three segments")]
    Segments,

    #[error("Token segment is not valid base64url")]
    Encoding,

    #[error("Token payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unsupported token header")]
    Header,

    #[error("Token signature mismatch")]
    Signature,

    #[error("Invalid signing secret")]
    Secret,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify() -> Result<(), SharedError> {
        Err(TokenError::Signature)?
    }

    #[test]
    fn test_shared_error_wraps_causes() {
        let err = verify().unwrap_err();
        assert!(matches!(err, SharedError::Token(TokenError::Signature)));
        assert_eq!(err.to_string(), "Token error: Token signature mismatch");
    }
}
