/// Protocol version, reported by the server's health route
pub const PROTOCOL_VERSION: &str = "missive/1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public/secret key size in bytes
pub const KEY_SIZE: usize = 32;

/// Subject used for tokens that authenticate nobody in particular
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Default lifetime of an issued token, in seconds (30 minutes)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 30 * 60;

/// Upper bound (and default) for a single inbox page
pub const MAX_FETCH_LIMIT: usize = 100;

/// Messages a receiving chain may skip ahead before a read is rejected
pub const MAX_SKIPPED_KEYS: u32 = 1000;

/// Root namespace shared by client and server stores
pub const DEFAULT_PARENT_CHANNEL: &str = "messages";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ENVELOPE: &str = "missive-envelope-key-v1";
pub const KDF_CONTEXT_ROOT: &str = "missive-session-root-v1";
pub const KDF_CONTEXT_CHAIN_INITIATOR: &str = "missive-chain-initiator-v1";
pub const KDF_CONTEXT_CHAIN_RESPONDER: &str = "missive-chain-responder-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "missive-message-key-v1";
pub const KDF_CONTEXT_CHAIN_STEP: &str = "missive-chain-step-v1";
