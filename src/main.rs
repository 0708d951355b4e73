use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use splix_arena_server::config::ServerConfig;
use splix_arena_server::game::score::LogScoreSink;
use splix_arena_server::metrics::{self, Metrics};
use splix_arena_server::net::game_session::{start_game_loop, GameSession};
use splix_arena_server::net::transport::ArenaServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Splix Arena Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().context("invalid configuration")?;
    info!(
        "Configuration loaded: {}:{}, arena {}x{}, {} Hz, max_connections={}",
        config.bind_address,
        config.port,
        config.arena.size,
        config.arena.size,
        config.tick_rate,
        config.max_connections
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let session = GameSession::new(&config, Box::new(LogScoreSink), metrics.clone())
        .context("failed to start arena worker")?;
    let server = ArenaServer::new(config.clone(), session.event_sender());
    let game_loop = start_game_loop(session);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e);
            }
        }
        result = game_loop => {
            // The loop only returns when the arena can no longer be updated
            match result {
                Ok(Err(e)) => return Err(e).context("game loop stopped"),
                Ok(Ok(())) => {}
                Err(e) => return Err(e).context("game loop panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    info!("Server stopped");
    Ok(())
}
