//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the WebSocket connection and its
//! reconnect loop, HTTP API wrappers (health, submit, history,
//! introspection) and the normalized [`events::EngineEvent`] stream the
//! rest of the service consumes.

pub mod api;
pub mod client;
pub mod events;
pub mod listener;
pub mod messages;
pub mod processor;
pub mod reconnect;
