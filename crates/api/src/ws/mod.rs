//! Client WebSocket: connection registry, heartbeat and the progress
//! subscription protocol.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
