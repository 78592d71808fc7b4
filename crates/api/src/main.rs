use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use atelier_comfyui::api::ComfyUIApi;
use atelier_comfyui::client::ComfyUIClient;
use atelier_comfyui::listener::spawn_listener;
use atelier_comfyui::reconnect::ReconnectConfig;
use atelier_pipeline::engine::GenerationEngine;
use atelier_pipeline::ledger::{CreditLedger, PgCreditLedger};
use atelier_pipeline::orchestrator::{Orchestrator, OrchestratorConfig};
use atelier_pipeline::progress::ProgressRouter;
use atelier_pipeline::reconciliation;
use atelier_pipeline::storage::LocalTempStore;
use atelier_pipeline::tasks::{PgTaskStore, TaskStore};
use atelier_pipeline::template::TemplateEngine;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_api::config::ServerConfig;
use atelier_api::router::build_app_router;
use atelier_api::state::AppState;
use atelier_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = atelier_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    atelier_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    atelier_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Workflow templates ---
    let templates =
        TemplateEngine::load_dir(&config.workflows_dir).expect("Failed to load workflow templates");
    tracing::info!(
        dir = %config.workflows_dir.display(),
        templates = ?templates.names(),
        "Workflow templates loaded",
    );

    let cancel = CancellationToken::new();

    // --- Engine ---
    let client_id = ComfyUIClient::generate_client_id();
    let engine_api = ComfyUIApi::new(config.comfyui_url.clone(), client_id.clone());
    let engine: Arc<dyn GenerationEngine> = Arc::new(engine_api);

    let ws_client = ComfyUIClient::new(
        ComfyUIClient::ws_url_from_api_url(&config.comfyui_url),
        client_id,
    );
    let (listener_handle, engine_events) =
        spawn_listener(ws_client, ReconnectConfig::default(), cancel.clone());

    // --- Progress routing ---
    let progress = ProgressRouter::new();
    let progress_handle = tokio::spawn(Arc::clone(&progress).run(engine_events, cancel.clone()));

    // --- Ledger, tasks, storage ---
    let ledger: Arc<dyn CreditLedger> = Arc::new(PgCreditLedger::new(pool.clone()));
    let tasks: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));
    let images = Arc::new(LocalTempStore::new(
        config.temp_upload_dir.clone(),
        config.temp_url_prefix.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        templates,
        Arc::clone(&engine),
        Arc::clone(&progress),
        Arc::clone(&ledger),
        Arc::clone(&tasks),
        images,
        OrchestratorConfig {
            generation_timeout: Duration::from_secs(config.generation_timeout_secs),
        },
    ));

    // --- Billing reconciliation ---
    let reconcile_handle = tokio::spawn(reconciliation::run(
        Arc::clone(&tasks),
        Arc::clone(&ledger),
        Duration::from_secs(config.reconcile_interval_secs),
        cancel.clone(),
    ));

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager), cancel.clone());

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        progress,
        engine,
        ledger,
        orchestrator,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    for (name, handle) in [
        ("engine listener", listener_handle),
        ("progress router", progress_handle),
        ("billing reconciliation", reconcile_handle),
        ("heartbeat", heartbeat_handle),
    ] {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!(task = name, "Background task did not stop in time");
        }
    }

    tracing::info!("Graceful shutdown complete");
}

/// `EnvFilter` from `RUST_LOG`, human-readable output unless
/// `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "atelier_api=debug,atelier_pipeline=debug,atelier_comfyui=info,tower_http=debug".into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for SIGINT or (on Unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
