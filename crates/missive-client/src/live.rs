//! Live delivery: a WebSocket that tells us when new mail is waiting.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use missive_shared::protocol::LIVE_SIGNAL;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::messenger::Messenger;

/// Authenticate on `url`, fetch once, then fetch again on every signal until
/// the server closes the connection.
pub async fn listen(messenger: Arc<Messenger>, url: &str) -> Result<(), ClientError> {
    messenger.ensure_ready().await?;
    let auth = serde_json::to_string(&messenger.live_auth().await?)?;
    let limit = messenger.config().fetch_limit;

    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();
    write.send(Message::Text(auth)).await?;
    info!(url, "Live connection open");

    // mail that arrived before the connection existed
    fetch(&messenger, limit).await;

    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => {
                if text != LIVE_SIGNAL {
                    debug!(%text, "Unexpected live frame");
                }
                fetch(&messenger, limit).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(url, "Live connection closed");
    Ok(())
}

async fn fetch(messenger: &Messenger, limit: usize) {
    if let Err(e) = messenger.get_messages(limit).await {
        warn!(error = %e, "Live fetch failed");
    }
}
