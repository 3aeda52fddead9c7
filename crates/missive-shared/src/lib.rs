pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod prekey;
pub mod protocol;
pub mod session;
pub mod token;
pub mod types;

pub use envelope::{Envelope, Opened};
pub use error::{CryptoError, IdentityError, SessionError, SharedError, TokenError};
pub use identity::{Identity, IdentityExport};
pub use prekey::{Card, OneTimeKey, Prekey};
pub use session::{Session, SessionInit, SessionState, SessionWire};
pub use types::UserId;
