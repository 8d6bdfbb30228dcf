use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use session_engine::api::api_routes;
use session_engine::config::{EngineConfig, ServerConfig};
use session_engine::llm::{LlmConfig, create_provider};
use session_engine::session::SessionManager;
use session_engine::store::{Database, LibSqlBackend};
use session_engine::transport::BridgeTransportFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&server);

    eprintln!("📨 Session Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/sessions", server.http_port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws/events", server.http_port);
    eprintln!("   Bridge: {}", server.bridge_url);

    let llm_config = LlmConfig::from_env().context("LLM configuration")?;
    let llm = create_provider(&llm_config);
    eprintln!("   Model: {}", llm_config.model);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("opening database at {}", server.db_path.display()))?,
    );
    eprintln!("   Database: {}", server.db_path.display());

    // ── Sessions ─────────────────────────────────────────────────────────
    let transports = Arc::new(BridgeTransportFactory::new(&server.bridge_url));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&db),
        llm,
        transports,
        EngineConfig::from_env(),
    ));
    let restored = sessions.restore_sessions().await?;
    eprintln!("   Restored sessions: {restored}\n");

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(Arc::clone(&sessions));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.http_port))
        .await
        .with_context(|| format!("binding port {}", server.http_port))?;
    tracing::info!(port = server.http_port, "Management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    sessions.shutdown_all().await;
    Ok(())
}

fn init_tracing(server: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false);

    match &server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "session-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
