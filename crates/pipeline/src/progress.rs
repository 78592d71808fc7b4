//! Progress router: fans engine events out to the client subscribed to a
//! task and wakes the orchestrator waiting on it.
//!
//! Engine events are keyed by the engine's job (prompt) id; clients and
//! the orchestrator know the task id. The router keeps both sides of that
//! mapping, plus the currently executing prompt for `progress` frames that
//! omit their id, under one [`std::sync::Mutex`]. The lock is never held
//! across an `.await`: sends on unbounded and oneshot channels do not
//! block.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use atelier_comfyui::events::{percent, EngineEvent};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Terminal events for prompts nobody has bound yet are kept this long
/// (by count) so a fast engine cannot finish before `bind_prompt` runs.
/// The oldest is evicted first.
const MAX_ORPHANED_TERMINALS: usize = 256;

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// Payload of a `progress` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    pub percent: i16,
    pub step: i32,
    pub total_steps: i32,
    pub node: Option<String>,
    pub title: Option<String>,
    pub completed: bool,
}

/// A message delivered to a subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressMessage {
    Subscribed {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    Progress {
        #[serde(rename = "taskId")]
        task_id: String,
        data: ProgressData,
        timestamp: i64,
    },
    Completed {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: i64,
    },
    Error {
        #[serde(rename = "taskId")]
        task_id: String,
        error: String,
        timestamp: i64,
    },
}

/// Where a client receives its task's messages.
pub type ProgressSink = mpsc::UnboundedSender<ProgressMessage>;

/// How a task's engine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed(String),
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Terminal {
    fn to_message(&self, task_id: &str) -> ProgressMessage {
        match self {
            Terminal::Completed => ProgressMessage::Completed {
                task_id: task_id.to_string(),
                timestamp: now_millis(),
            },
            Terminal::Failed(error) => ProgressMessage::Error {
                task_id: task_id.to_string(),
                error: error.clone(),
                timestamp: now_millis(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Route {
    sink: Option<ProgressSink>,
    waiter: Option<oneshot::Sender<Terminal>>,
    prompt_id: Option<String>,
}

impl Route {
    fn is_empty(&self) -> bool {
        self.sink.is_none() && self.waiter.is_none()
    }
}

struct PromptBinding {
    task_id: String,
    titles: HashMap<String, String>,
    current_node: Option<String>,
}

#[derive(Default)]
struct RouterState {
    routes: HashMap<String, Route>,
    prompts: HashMap<String, PromptBinding>,
    orphaned: VecDeque<(String, Terminal)>,
    current_prompt: Option<String>,
}

impl RouterState {
    /// Send to a route's sink, dropping the sink if the client is gone.
    fn deliver(&mut self, task_id: &str, message: ProgressMessage) -> bool {
        let Some(route) = self.routes.get_mut(task_id) else {
            return false;
        };
        let Some(sink) = &route.sink else {
            return false;
        };
        if sink.send(message).is_ok() {
            return true;
        }
        tracing::debug!(task_id, "Progress sink closed, removing");
        route.sink = None;
        if route.is_empty() {
            self.routes.remove(task_id);
        }
        false
    }

    /// Deliver a terminal event and tear the task's routing down.
    fn finish(&mut self, task_id: &str, terminal: Terminal) {
        let Some(route) = self.routes.remove(task_id) else {
            return;
        };
        if let Some(prompt_id) = &route.prompt_id {
            self.prompts.remove(prompt_id);
            if self.current_prompt.as_deref() == Some(prompt_id.as_str()) {
                self.current_prompt = None;
            }
        }
        if let Some(sink) = route.sink {
            let _ = sink.send(terminal.to_message(task_id));
        }
        if let Some(waiter) = route.waiter {
            let _ = waiter.send(terminal);
        }
    }

    fn take_orphaned(&mut self, prompt_id: &str) -> Option<Terminal> {
        let index = self.orphaned.iter().position(|(id, _)| id == prompt_id)?;
        self.orphaned.remove(index).map(|(_, terminal)| terminal)
    }

    fn resolve_prompt(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.current_prompt.clone())
    }

    fn terminal_for_prompt(&mut self, prompt_id: Option<String>, terminal: Terminal) {
        let Some(prompt_id) = prompt_id else {
            tracing::debug!("Terminal engine event without a prompt id, ignoring");
            return;
        };
        if self.current_prompt.as_deref() == Some(prompt_id.as_str()) {
            self.current_prompt = None;
        }
        match self.prompts.get(&prompt_id).map(|b| b.task_id.clone()) {
            Some(task_id) => self.finish(&task_id, terminal),
            None => {
                self.take_orphaned(&prompt_id);
                if self.orphaned.len() >= MAX_ORPHANED_TERMINALS {
                    if let Some((evicted, _)) = self.orphaned.pop_front() {
                        tracing::warn!(prompt_id = %evicted, "Dropping oldest unbound terminal event");
                    }
                }
                tracing::debug!(prompt_id = %prompt_id, "Terminal event for unbound prompt, holding");
                self.orphaned.push_back((prompt_id, terminal));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProgressRouter {
    state: Mutex<RouterState>,
}

impl ProgressRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `sink` for `task_id`, replacing any previous sink, and
    /// confirm with a `subscribed` message.
    pub fn subscribe(&self, task_id: &str, sink: ProgressSink) {
        let mut state = self.lock();
        let route = state.routes.entry(task_id.to_string()).or_default();
        if route.sink.as_ref().is_some_and(|old| !old.same_channel(&sink)) {
            tracing::debug!(task_id, "Replacing progress subscriber");
        }
        route.sink = Some(sink);
        state.deliver(
            task_id,
            ProgressMessage::Subscribed {
                task_id: task_id.to_string(),
            },
        );
    }

    /// Drop the client sink for `task_id`. Idempotent; the orchestrator's
    /// waiter, if any, stays.
    pub fn unsubscribe(&self, task_id: &str) {
        let mut state = self.lock();
        if let Some(route) = state.routes.get_mut(task_id) {
            route.sink = None;
            if route.is_empty() {
                state.routes.remove(task_id);
            }
        }
    }

    /// Drop `sink` from every task it is subscribed to. Used when a client
    /// connection closes; sinks owned by other connections are untouched.
    pub fn detach_sink(&self, sink: &ProgressSink) {
        let mut state = self.lock();
        state.routes.retain(|_, route| {
            if route.sink.as_ref().is_some_and(|s| s.same_channel(sink)) {
                route.sink = None;
            }
            !route.is_empty()
        });
    }

    /// Register the orchestrator's completion waiter for `task_id`.
    ///
    /// Dropping the returned watch before it resolves tears the task's
    /// routing down.
    pub fn watch(self: &Arc<Self>, task_id: &str) -> CompletionWatch {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let route = state.routes.entry(task_id.to_string()).or_default();
        route.waiter = Some(tx);
        CompletionWatch {
            router: Arc::clone(self),
            task_id: task_id.to_string(),
            rx,
            resolved: false,
        }
    }

    /// Map an engine job id to the task waiting on it. `titles` label the
    /// job's nodes in progress messages.
    pub fn bind_prompt(&self, task_id: &str, prompt_id: &str, titles: HashMap<String, String>) {
        let mut state = self.lock();
        if let Some(route) = state.routes.get_mut(task_id) {
            route.prompt_id = Some(prompt_id.to_string());
        }
        state.prompts.insert(
            prompt_id.to_string(),
            PromptBinding {
                task_id: task_id.to_string(),
                titles,
                current_node: None,
            },
        );
        if let Some(terminal) = state.take_orphaned(prompt_id) {
            tracing::debug!(task_id, prompt_id, "Engine finished before binding");
            state.finish(task_id, terminal);
        }
    }

    /// End a task from outside the engine's event stream (mock results,
    /// timeout, cancellation). Subscribers get the terminal message; the
    /// waiter, if still registered, is resolved.
    pub fn finish(&self, task_id: &str, terminal: Terminal) {
        self.lock().finish(task_id, terminal);
    }

    /// Route one engine event.
    pub fn dispatch(&self, event: EngineEvent) {
        let mut state = self.lock();
        match event {
            EngineEvent::Connected => tracing::info!("Engine event channel connected"),
            EngineEvent::Disconnected => {
                tracing::warn!("Engine event channel disconnected");
                state.current_prompt = None;
            }
            EngineEvent::ExecutionStarted { prompt_id } => {
                state.current_prompt = Some(prompt_id);
            }
            EngineEvent::NodeExecuting { prompt_id, node } => {
                let Some(prompt_id) = state.resolve_prompt(prompt_id.as_deref()) else {
                    return;
                };
                if let Some(binding) = state.prompts.get_mut(&prompt_id) {
                    binding.current_node = Some(node);
                }
                state.current_prompt = Some(prompt_id);
            }
            EngineEvent::Progress {
                prompt_id,
                node,
                value,
                max,
            } => {
                let Some(prompt_id) = state.resolve_prompt(prompt_id.as_deref()) else {
                    tracing::debug!("Progress without a known prompt, dropping");
                    return;
                };
                let Some(binding) = state.prompts.get(&prompt_id) else {
                    tracing::debug!(prompt_id = %prompt_id, "Progress for unbound prompt, dropping");
                    return;
                };
                let node = node.or_else(|| binding.current_node.clone());
                let title = node.as_ref().and_then(|n| binding.titles.get(n)).cloned();
                let task_id = binding.task_id.clone();
                let message = ProgressMessage::Progress {
                    task_id: task_id.clone(),
                    data: ProgressData {
                        percent: percent(value, max),
                        step: value,
                        total_steps: max,
                        node,
                        title,
                        completed: false,
                    },
                    timestamp: now_millis(),
                };
                if !state.deliver(&task_id, message) {
                    tracing::debug!(task_id = %task_id, "No subscriber for progress, dropping");
                }
            }
            EngineEvent::Completed { prompt_id } => {
                let prompt_id = state.resolve_prompt(prompt_id.as_deref());
                state.terminal_for_prompt(prompt_id, Terminal::Completed);
            }
            EngineEvent::Failed {
                prompt_id, message, ..
            } => {
                state.terminal_for_prompt(Some(prompt_id), Terminal::Failed(message));
            }
        }
    }

    /// Pump engine events into the router until cancelled or the channel
    /// closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        tracing::info!("Progress router stopped");
    }

    /// Whether a client sink is registered for `task_id`.
    pub fn is_subscribed(&self, task_id: &str) -> bool {
        self.lock()
            .routes
            .get(task_id)
            .is_some_and(|r| r.sink.is_some())
    }

    /// Whether anything (sink or waiter) is registered for `task_id`.
    pub fn is_routed(&self, task_id: &str) -> bool {
        self.lock().routes.contains_key(task_id)
    }

    pub fn route_count(&self) -> usize {
        self.lock().routes.len()
    }
}

// ---------------------------------------------------------------------------
// Completion watch
// ---------------------------------------------------------------------------

/// The orchestrator's handle on a task's terminal event.
pub struct CompletionWatch {
    router: Arc<ProgressRouter>,
    task_id: String,
    rx: oneshot::Receiver<Terminal>,
    resolved: bool,
}

impl CompletionWatch {
    /// Wait for the terminal event. `None` if the waiter was replaced by
    /// another watch on the same task.
    pub async fn recv(&mut self) -> Option<Terminal> {
        let terminal = (&mut self.rx).await.ok();
        self.resolved = true;
        terminal
    }
}

impl Drop for CompletionWatch {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Closing first lets the waiter report whether it is still ours.
        self.rx.close();
        let mut state = self.router.lock();
        let owns_route = state
            .routes
            .get(&self.task_id)
            .and_then(|r| r.waiter.as_ref())
            .is_some_and(|w| w.is_closed());
        if owns_route {
            tracing::debug!(task_id = %self.task_id, "Completion watch dropped, removing route");
            state.finish(&self.task_id, Terminal::Failed("Generation cancelled".into()));
        }
    }
}
