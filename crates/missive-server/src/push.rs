//! Outbound platform push notifications.

use async_trait::async_trait;
use missive_shared::protocol::PushSubscription;
use missive_shared::types::UserId;
use serde::Serialize;

use crate::error::ServerError;

/// Body of a "you have mail" notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new_mail() -> Self {
        Self {
            title: "Missive".into(),
            body: "New message".into(),
        }
    }
}

/// Delivers notifications to a subscription's endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        user: &UserId,
        subscription: &PushSubscription,
        notification: &Notification,
    ) -> Result<(), ServerError>;
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct TracingPush;

#[async_trait]
impl PushTransport for TracingPush {
    async fn send(
        &self,
        user: &UserId,
        subscription: &PushSubscription,
        notification: &Notification,
    ) -> Result<(), ServerError> {
        tracing::info!(
            user = %user.short(),
            endpoint = %subscription.endpoint,
            title = %notification.title,
            "Push notification"
        );
        Ok(())
    }
}
