use std::{net::SocketAddr, sync::Arc, time::Duration};

use renode::{
    audio::FfmpegPipelineFactory,
    common::{http::HttpClient, logger, types::AnyResult},
    configs::Config,
    gateway::{GatewayConnector, GatewaySettings},
    log_println,
    player::PlayerDeps,
    server::AppState,
    sources::SourceManager,
    transport,
};
use tracing::info;

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log_println!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logger::init(&config.logging);

    let http = HttpClient::new()?;
    let sources = Arc::new(SourceManager::new(&config, http.clone()));
    info!("Enabled sources: {}", sources.names().join(", "));

    let deps = PlayerDeps {
        sources,
        pipelines: Arc::new(FfmpegPipelineFactory::new(config.player.clone(), http)),
        connector: Arc::new(GatewayConnector::new(GatewaySettings::from(&config.player))),
        config: config.player.clone(),
        update_interval: Duration::from_secs(config.server.player_update_interval_secs.max(1)),
    };

    let address: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(config, deps));

    let app = transport::http_server::router(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Renode listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, releasing players");
    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
