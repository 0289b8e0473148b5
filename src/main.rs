use std::sync::Arc;

use domino_server::{
    app::{
        ArcMatchHistoryRepository, ArcModerationSink, ArcRatingRepository, LazyAppState,
        construct_app,
    },
    client::TransportServiceImpl,
    config::ServerConfig,
    logs::init_logger,
    persistence::{InMemoryMatchHistoryRepository, InMemoryRatingRepository},
};
use log::info;

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received. Preparing graceful exit...");
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    init_logger();

    let config = ServerConfig::from_env();

    let lazy = LazyAppState::new();
    let transport_service_impl =
        TransportServiceImpl::new(lazy.clone(), config.heartbeat_timeout);

    let match_history_repository: ArcMatchHistoryRepository =
        Arc::new(Box::new(InMemoryMatchHistoryRepository::new()));
    let rating_repository: ArcRatingRepository =
        Arc::new(Box::new(InMemoryRatingRepository::new()));
    let moderation_sink: ArcModerationSink =
        Arc::new(Box::new(domino_server::abuse::LogModerationSink));

    let app = construct_app(
        &lazy,
        config,
        Arc::new(Box::new(transport_service_impl.clone())),
        match_history_repository,
        rating_repository,
        moderation_sink,
    );

    info!("Starting application");

    let shutdown = app.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    transport_service_impl.run(app).await;

    info!("Server stopped");
}
