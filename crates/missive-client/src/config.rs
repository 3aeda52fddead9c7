use missive_shared::constants::{DEFAULT_PARENT_CHANNEL, MAX_FETCH_LIMIT};
use missive_shared::identity::IdentityExport;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the Missive server, e.g. `https://mail.example.org`
    pub server_url: String,

    /// Root segment under which every local record is stored
    pub parent_channel: String,

    /// Identity to use instead of the stored (or a fresh) one
    pub user_data: Option<IdentityExport>,

    /// Page size used when a live signal triggers a fetch
    pub fetch_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            parent_channel: DEFAULT_PARENT_CHANNEL.to_string(),
            user_data: None,
            fetch_limit: MAX_FETCH_LIMIT,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// WebSocket URL of the live endpoint.
    pub fn live_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws")
    }
}
