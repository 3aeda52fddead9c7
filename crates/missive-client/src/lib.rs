//! # missive-client
//!
//! Client side of the Missive protocol: identity and prekey management,
//! per-contact ratchet sessions, the local contact and message store, and
//! the calls to a Missive server.
//!
//! [`Messenger`] is the entry point. It owns every component and is safe to
//! share behind an `Arc`.

pub mod api;
pub mod config;
pub mod contacts;
pub mod context;
pub mod error;
pub mod events;
pub mod live;
pub mod messenger;
pub mod prekey;
pub mod push;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use contacts::{Contact, MessageRecord, MessageStatus, Profile};
pub use error::ClientError;
pub use events::ClientEvent;
pub use messenger::Messenger;
pub use push::{PushPermission, PushProvider};
pub use transport::{HttpTransport, Transport};
