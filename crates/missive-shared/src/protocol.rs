use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::random_bytes;
use crate::envelope::Envelope;
use crate::prekey::OneTimeKey;
use crate::token::Claims;
use crate::types::UserId;

/// What travels inside a session ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    /// User content, opaque to the protocol
    Message(Value),
    /// Internal signalling, never stored as a message
    Control(Control),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// The sender lost its session with us; start over from our card
    Reset,
}

// --- Inbox keys ---

/// Build a unique, time-ordered inbox key: `"000"`, 13 digits of
/// milliseconds, then 32 random hex chars.
pub fn inbox_key(timestamp_ms: i64) -> String {
    format!("000{:013}{}", timestamp_ms, hex::encode(random_bytes::<16>()))
}

/// Recover the millisecond timestamp encoded in an inbox key.
pub fn timestamp_from_key(key: &str) -> Option<i64> {
    key.get(3..16)?.parse().ok()
}

// --- Wire messages (client <-> server) ---

/// `hello` answer, sealed to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub anon_token: String,
    pub user_token: String,
    pub decoded: Claims,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardQuery {
    pub id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRequest {
    pub token: String,
    pub msg: CardQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub token: String,
    pub msg: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub sent: bool,
    pub timestamp: i64,
}

/// `messages` request, sealed to the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
}

/// One pending message in a user's inbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub key: String,
    pub data: Envelope,
}

/// `opk` request, sealed to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpkRequest {
    pub opk: OneTimeKey,
    pub token: String,
}

/// `acknowledge` request, sealed to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    pub token: String,
    pub ids: Vec<String>,
}

/// `deleteme` request, sealed to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMeRequest {
    pub delete: bool,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Updated {
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deleted {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushKeys {
    pub auth: String,
    pub p256dh: String,
}

/// Web-push style subscription, keyed by its auth secret
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscription: PushSubscription,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribed {
    pub subscribed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unsubscribed {
    pub unsubscribed: bool,
}

/// First frame of a live connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveAuth {
    pub id: UserId,
    pub token: String,
}

/// Signal pushed over a live connection when new mail arrives
pub const LIVE_SIGNAL: &str = "1";

/// Error body returned with every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}
