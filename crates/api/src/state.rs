use std::sync::Arc;

use atelier_pipeline::engine::GenerationEngine;
use atelier_pipeline::ledger::CreditLedger;
use atelier_pipeline::orchestrator::Orchestrator;
use atelier_pipeline::progress::ProgressRouter;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: everything is behind an `Arc` or is a pool handle.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, used for health reporting.
    pub pool: atelier_db::DbPool,
    pub config: Arc<ServerConfig>,
    /// Browser WebSocket connections.
    pub ws_manager: Arc<WsManager>,
    /// Task-keyed progress subscriptions fed by the engine listener.
    pub progress: Arc<ProgressRouter>,
    pub engine: Arc<dyn GenerationEngine>,
    pub ledger: Arc<dyn CreditLedger>,
    pub orchestrator: Arc<Orchestrator>,
}
