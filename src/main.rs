use anyhow::Result;
use std::net::SocketAddr;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation and better throughput
// on long-running server processes.
// On Windows/macOS the default system allocator is used instead.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use huddle_server::config::ServerConfig;
use huddle_server::websocket::ServerState;
use huddle_server::{database, routing};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("huddle_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Huddle server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let db_pool = database::init(&config.database_url).await?;
    info!("Database initialized");

    let state = std::sync::Arc::new(ServerState::new(db_pool.clone(), config.clone()));

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Graceful shutdown signal (cross-platform)
    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // Checkpoint SQLite WAL before exit
    info!("Checkpointing SQLite WAL...");
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db_pool)
        .await
    {
        warn!("WAL checkpoint failed: {}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}
