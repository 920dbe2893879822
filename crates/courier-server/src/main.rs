use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_server::api::{self, AppState};
use courier_server::relay::{spawn_presence_sweeper, RelayHub};
use courier_server::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        max_sessions = config.max_sessions,
        presence_timeout_secs = config.presence_timeout().as_secs(),
        admin_enabled = config.admin_token.is_some(),
        "Relay settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let hub = Arc::new(RelayHub::open(&config)?);
    let http_addr = config.http_addr;
    let app_state = AppState::new(hub.clone(), config.clone());

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Presence sweeper: one pass per heartbeat interval
    spawn_presence_sweeper(hub, config.heartbeat_interval);

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    let send_limits = app_state.hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
            send_limits.purge_idle_send_limits(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + websocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
