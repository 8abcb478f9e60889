use anyhow::Result;
use hcloud_upload::{
    app,
    config::{AppConfig, TransportKind},
    services::{
        bot_api_transport::BotApiTransport, memory_transport::MemoryTransport,
        session_store::{SessionStore, SystemClock},
        sweeper::spawn_sweeper,
        transport::Transport,
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting upload relay with config: {:?}", cfg);

    // --- Transport ---
    let transport: Arc<dyn Transport> = match cfg.transport {
        TransportKind::Bot => {
            let chat_id = cfg.chat_id.clone().unwrap_or_default();
            Arc::new(BotApiTransport::new(cfg.bot_api_url.clone(), chat_id)?)
        }
        TransportKind::Memory => {
            tracing::warn!("Using in-memory transport; uploaded files are lost on restart");
            Arc::new(MemoryTransport::new())
        }
    };

    // --- Session store + background sweeper ---
    let store = SessionStore::new(
        Arc::new(SystemClock),
        chrono::Duration::from_std(cfg.session_ttl)?,
    )
    .with_max_total_chunks(cfg.max_total_chunks);
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(store.clone(), cfg.sweep_interval, shutdown.clone());

    // --- Build router ---
    let app = app(store, transport, cfg.cors.clone(), cfg.max_body_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    sweeper.await?;
    Ok(())
}
