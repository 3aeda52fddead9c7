//! Platform push integration.

use async_trait::async_trait;
use missive_shared::protocol::PushSubscription;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPermission {
    Granted,
    Denied,
}

/// Source of push subscriptions, e.g. a browser push manager or a mobile
/// notification service.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn permission(&self) -> PushPermission;

    /// Create (or return the existing) subscription for this device.
    async fn subscribe(&self) -> Result<PushSubscription, ClientError>;

    async fn unsubscribe(&self, subscription: &PushSubscription) -> Result<(), ClientError>;
}
