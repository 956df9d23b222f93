mod classifier;
mod config;
mod llm;
mod orchestrator;
mod routes;
mod tools;

use config::ServerConfig;
use orchestrator::Orchestrator;
use parley_shared::tokens::TokenizerHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley_server=info,tower_http=info")),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    info!(
        flavor = ?config.api_flavor,
        host = %config.api_host,
        default_model = %config.default_model,
        "provider configured"
    );
    if config.api_key.is_none() {
        info!("OPENAI_API_KEY not set, requests must carry their own apiKey");
    }

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), TokenizerHandle::shared()));
    info!(tools = ?orchestrator.tools().names().collect::<Vec<_>>(), "tools available");

    let app = routes::router(orchestrator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!("Server listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
