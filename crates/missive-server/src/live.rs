//! Registry of live (WebSocket) connections, keyed by identity.
//!
//! One identity may hold several connections at once (one per device).
//! Each connection is an unbounded channel drained by its socket task.

use std::collections::HashMap;
use std::sync::Arc;

use missive_shared::protocol::LIVE_SIGNAL;
use missive_shared::types::UserId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Clone, Default)]
pub struct LiveRouter {
    connections: Arc<RwLock<HashMap<UserId, HashMap<ConnectionId, mpsc::UnboundedSender<String>>>>>,
}

impl LiveRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user`. Returns its id and signal receiver.
    pub async fn connect(&self, user: UserId) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        let devices = connections.entry(user).or_default();
        devices.insert(id, tx);

        info!(user = %user.short(), connection = %id, devices = devices.len(), "Live connection opened");
        (id, rx)
    }

    pub async fn disconnect(&self, user: &UserId, id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(devices) = connections.get_mut(user) {
            devices.remove(id);
            if devices.is_empty() {
                connections.remove(user);
            }
        }
        info!(user = %user.short(), connection = %id, "Live connection closed");
    }

    /// Signal every connection of `user` that mail is waiting.
    /// Returns how many connections were reached.
    pub async fn notify(&self, user: &UserId) -> usize {
        let connections = self.connections.read().await;
        let Some(devices) = connections.get(user) else {
            return 0;
        };

        let mut reached = 0;
        for (id, tx) in devices {
            if tx.send(LIVE_SIGNAL.to_string()).is_ok() {
                reached += 1;
            } else {
                debug!(user = %user.short(), connection = %id, "Dropping signal for closed connection");
            }
        }
        reached
    }

    pub async fn connection_count(&self, user: &UserId) -> usize {
        self.connections
            .read()
            .await
            .get(user)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect() {
        let router = LiveRouter::new();
        let user = UserId([1; 32]);

        let (first, _rx1) = router.connect(user).await;
        let (second, _rx2) = router.connect(user).await;
        assert_eq!(router.connection_count(&user).await, 2);

        router.disconnect(&user, &first).await;
        assert_eq!(router.connection_count(&user).await, 1);
        assert!(router.is_connected(&user).await);

        router.disconnect(&user, &second).await;
        assert!(!router.is_connected(&user).await);
    }

    #[tokio::test]
    async fn test_notify_reaches_every_device() {
        let router = LiveRouter::new();
        let user = UserId([1; 32]);
        let other = UserId([2; 32]);

        let (_, mut phone) = router.connect(user).await;
        let (_, mut laptop) = router.connect(user).await;
        let (_, mut bystander) = router.connect(other).await;

        assert_eq!(router.notify(&user).await, 2);
        assert_eq!(phone.try_recv().unwrap(), "1");
        assert_eq!(laptop.try_recv().unwrap(), "1");
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_unknown_user_and_dropped_receiver() {
        let router = LiveRouter::new();
        let user = UserId([1; 32]);
        assert_eq!(router.notify(&user).await, 0);

        let (_, rx) = router.connect(user).await;
        drop(rx);
        assert_eq!(router.notify(&user).await, 0);
    }
}
