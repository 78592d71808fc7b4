//! Message type constants for the client-facing progress WebSocket.
//!
//! Used by the progress router when it builds outbound messages and by the
//! API WebSocket handler when it parses inbound ones.

// -- outbound ---------------------------------------------------------------

/// Acknowledges a subscription.
pub const MSG_TYPE_SUBSCRIBED: &str = "subscribed";

/// Step-level progress for a task.
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// The engine finished the task.
pub const MSG_TYPE_COMPLETED: &str = "completed";

/// The engine reported a failure for the task.
pub const MSG_TYPE_ERROR: &str = "error";

pub const MSG_TYPE_PONG: &str = "pong";

// -- inbound ----------------------------------------------------------------

pub const MSG_TYPE_SUBSCRIBE: &str = "subscribe";
pub const MSG_TYPE_UNSUBSCRIBE: &str = "unsubscribe";
pub const MSG_TYPE_PING: &str = "ping";
