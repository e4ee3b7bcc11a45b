//! Runtime handle contract
//!
//! The control core never looks inside a running agent. Everything it needs
//! is on [`RuntimeHandle`]: event subscription, triggering, input injection
//! and cancellation. [`scripted::ScriptedRuntime`] is an in-process
//! implementation that replays a declared event script on worker threads.

pub mod loader;
pub mod scripted;
pub mod ticket;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventSet, RuntimeEvent};

pub use loader::{
    AgentLoader, AgentOwner, AgentRole, GuardianPolicy, LoadError, LoadRequest, LoadedAgent,
};
#[cfg(test)]
pub use loader::MockAgentOwner;
pub use scripted::{ScriptStep, ScriptedRuntime, ScriptedRuntimeBuilder};
pub use ticket::{ExecutionTicket, ExecutionTracker};

/// Identifier returned by [`RuntimeHandle::trigger`].
pub type ExecutionId = String;

/// Token for a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Event callback. Invoked once per matching event, in emission order, from
/// whichever thread the runtime emits on.
pub type EventHandler = Arc<dyn Fn(RuntimeEvent) + Send + Sync>;

/// Named way into a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub id: String,
    pub entry_node: String,
}

/// Errors surfaced by a runtime handle.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("node '{node_id}' is not waiting for input")]
    NotBlocked { node_id: String },

    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    #[error("graph '{0}' not found")]
    GraphNotFound(String),

    #[error("entry point '{0}' not found")]
    EntryPointNotFound(String),

    #[error("runtime is stopped")]
    Stopped,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// One live agent execution context.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Identity of the loaded agent graph.
    fn graph_id(&self) -> &str;

    /// Graph currently in focus (handles may multiplex several).
    fn active_graph_id(&self) -> String;

    /// Move focus to another registered graph.
    fn set_active_graph(&self, graph_id: &str) -> RuntimeResult<()>;

    /// Every registered graph, primary first.
    fn list_graphs(&self) -> Vec<String>;

    fn is_running(&self) -> bool;

    /// Entry points of the primary graph; the first one is the default.
    fn entry_points(&self) -> Vec<EntryPoint>;

    fn subscribe(&self, event_types: EventSet, handler: EventHandler)
        -> RuntimeResult<SubscriptionId>;

    fn unsubscribe(&self, subscription: SubscriptionId) -> RuntimeResult<()>;

    /// Start an execution. Returns once it has been scheduled, not when it
    /// completes.
    async fn trigger(&self, entry_point_id: &str, input_data: Value) -> RuntimeResult<ExecutionId>;

    /// Deliver a resume value to a node blocked on external input.
    async fn inject_input(&self, node_id: &str, message: &str) -> RuntimeResult<()>;

    /// Look up an execution in one graph's stream registrations.
    fn find_execution(&self, graph_id: &str, execution_id: &str) -> Option<ExecutionTicket>;

    /// Find an unfinished execution across all graphs, focused graph first.
    fn locate_execution(&self, execution_id: &str) -> Option<ExecutionTicket> {
        let active = self.active_graph_id();
        let others = self.list_graphs().into_iter().filter(|g| *g != active);
        std::iter::once(active.clone())
            .chain(others)
            .filter_map(|graph_id| self.find_execution(&graph_id, execution_id))
            .find(|ticket| !ticket.is_finished())
    }

    /// Request cancellation. Returns whether an unfinished execution was found;
    /// completion is observed later through events or the ticket.
    fn cancel(&self, execution_id: &str) -> bool {
        match self.locate_execution(execution_id) {
            Some(ticket) => {
                ticket.request_cancel();
                true
            }
            None => false,
        }
    }
}
