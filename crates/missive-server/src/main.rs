use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use missive_server::api::{self, AppState};
use missive_server::push::TracingPush;
use missive_server::{open_store, Mailroom, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,missive_server=debug")),
        )
        .init();

    info!("Starting Missive server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = open_store(&config)?;
    let mailroom = Arc::new(Mailroom::new(
        store,
        &config.parent_channel,
        config.token_ttl_secs,
        Arc::new(TracingPush),
    ));

    // Load or create the server identity before accepting traffic
    let server_id = mailroom.identity().await?;
    info!(server = %server_id, "Server identity ready");

    let app_state = AppState { mailroom };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr, config.cors_any) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
