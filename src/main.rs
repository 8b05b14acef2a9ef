use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_gateway::{
    api, auth, blocklist, config::GatewayConfig, heartbeat, llm, state::AppState,
    telemetry::TracingTelemetry, ws,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LLM gateway...");

    let config = GatewayConfig::from_env();
    let auth_config = auth::AuthConfig::from_env();
    let block_config = blocklist::BlockListConfig::from_env();

    // Initialize LLM providers
    let llm_config = llm::LlmConfig::from_env();
    let llm_manager = llm_config.build_manager()?;
    tracing::info!("LLM providers available: {:?}", llm_manager.available());

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(llm_manager),
        Arc::new(auth_config.build_verifier()),
        Arc::new(blocklist::StaticBlockList::new(&block_config)),
        Arc::new(TracingTelemetry),
    ));

    // Spawn background task that pings peers and reaps dead connections
    heartbeat::spawn_heartbeat(state.registry.clone(), config.heartbeat_interval);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(api::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    tracing::info!("Listening on http://{}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    Ok(())
}

/// Resolves on Ctrl-C after notifying peers and tearing down every connection
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    state.shutdown().await;
}
