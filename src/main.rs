//! harmony-chat - streaming chat API for gpt-oss style models
//!
//! Serves conversations over HTTP and streams each exchange back as NDJSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harmony_chat::config::{ClientConfig, Config};
use harmony_chat::core::{ChatEngine, EngineSettings, SqliteStore};
use harmony_chat::providers;
use harmony_chat::routes::{self, AppState};
use harmony_chat::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harmony_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let client = ClientConfig::load(config.client_config.as_deref())?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let store = Arc::new(SqliteStore::open(&config.database_path()).await?);
    let provider = providers::from_config(&client.llm, &config)?;

    let tools = ToolRegistry::builtin();
    for name in &client.chat.enabled_tools {
        if !tools.contains(name) {
            tracing::warn!(tool = %name, "Configured tool is not registered");
        }
    }
    tracing::info!("Loaded {} tool(s)", tools.len());

    let settings = EngineSettings {
        max_tool_rounds: config.max_tool_rounds,
        max_continuations: config.max_continuations,
        terminal_policy: client.chat.terminal_policy,
        chunk_buffer: config.chunk_buffer,
    };
    let engine = Arc::new(ChatEngine::new(provider, Arc::new(tools), store).with_settings(settings));

    let state = AppState {
        engine,
        default_options: client.default_options(),
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!(model = %client.llm.model, "harmony-chat listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
