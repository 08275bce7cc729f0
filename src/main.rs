//! StudyMate - study assistant conversation API
//!
//! Keeps per-conversation chat histories, asks an LLM provider for replies
//! and reveals each reply chunk by chunk to connected clients.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;
mod storage;

use config::Config;
use crate::core::{ConversationEngine, EngineConfig};
use providers::{CompletionGateway, Provider};
use storage::SqliteStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<ConversationEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studymate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let store = Arc::new(SqliteStore::new(&config.database_path()).await?);

    let provider = Provider::from_config(&config.llm)?;
    tracing::info!(provider = provider.name(), model = %config.llm.model, "Using LLM provider");
    let gateway: Arc<dyn CompletionGateway> = Arc::new(provider);

    let engine = Arc::new(ConversationEngine::new(
        store,
        gateway,
        EngineConfig::from(&config),
    ));

    let repaired = engine.repair_index().await?;
    if repaired > 0 {
        tracing::warn!("Re-indexed {} conversation(s)", repaired);
    }

    let state = AppState { config, engine };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("StudyMate API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
