use std::sync::{Mutex, PoisonError};

use missive_shared::types::UserId;
use tokio::sync::mpsc;

use crate::contacts::MessageRecord;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A received message was stored under `contacts/<contact>/messages/<key>`
    MessageSaved {
        contact: UserId,
        key: String,
        message: MessageRecord,
    },
    /// A fetch produced at least one user message
    GotMessages(Vec<MessageRecord>),
}

/// Single-subscriber event channel. Subscribing again replaces the
/// previous receiver, which then sees the channel close.
#[derive(Default)]
pub struct EventHub {
    tx: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn emit(&self, event: ClientEvent) {
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = slot.as_ref() {
            if tx.send(event).is_err() {
                tracing::debug!("Event receiver dropped");
                *slot = None;
            }
        }
    }
}
