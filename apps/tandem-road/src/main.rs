use clap::Parser;
use tandem_road::{
    cli::{self, Cli, Commands},
    config::Config,
    registry::RoomRegistry,
    router,
    signaling::SignalingHub,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Debug { url, room, ready }) = cli.command {
        if let Err(e) = cli::run_debug_client(url, room, ready).await {
            error!("Debug client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = cli.apply(Config::from_env());
    let addr = config.listen_addr();
    info!("Starting Tandem Road signaling relay on {}", addr);

    let hub = SignalingHub::new(RoomRegistry::new()).spawn(config.hub_queue_depth);
    let app = router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Tandem Road listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install shutdown handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
