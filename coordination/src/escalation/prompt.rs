//! Escalation requests and the instruction handed to the escalation target.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::events::RuntimeEvent;

/// Reason attached to escalations started from the keyboard.
pub const USER_ESCALATION_REASON: &str = "User-initiated escalation";

/// Injected into the blocked worker node when the return carries no summary.
pub const DEFAULT_RESUME_MESSAGE: &str = "Coder session completed. Continuing.";

const FALLBACK_INSTRUCTION: &str = "The user needs help modifying their agent.";

/// Why an escalation was requested and where the worker is waiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub reason: String,
    pub context: String,
    /// Worker node blocked on the escalation; empty when none.
    pub node_id: String,
}

impl EscalationRequest {
    pub fn new(
        reason: impl Into<String>,
        context: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            context: context.into(),
            node_id: node_id.into(),
        }
    }

    /// Escalation started by the user: nothing is blocked.
    pub fn user_initiated() -> Self {
        Self::new(USER_ESCALATION_REASON, "", "")
    }

    /// Read `reason` and `context` from an ESCALATION_REQUESTED payload.
    pub fn from_event(event: &RuntimeEvent) -> Self {
        let node_id = event
            .node_id()
            .or_else(|| event.str_field("node_id"))
            .unwrap_or_default();
        Self::new(
            event.str_field("reason").unwrap_or_default(),
            event.str_field("context").unwrap_or_default(),
            node_id,
        )
    }

    pub fn blocked_node(&self) -> Option<&str> {
        (!self.node_id.is_empty()).then_some(self.node_id.as_str())
    }
}

/// Compose the first message for the escalation target.
///
/// Parts are separated by a blank line; the worker location leads so the
/// target never has to ask which agent to change.
pub fn build_escalation_input(reason: &str, context: &str, worker_path: Option<&Path>) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(path) = worker_path {
        parts.push(format!(
            "Modify the agent at: {}\nDo NOT ask which agent to modify; it is the path above.",
            path.display()
        ));
    }
    if !reason.is_empty() {
        parts.push(format!("Problem: {reason}"));
    }
    if !context.is_empty() {
        parts.push(format!("Context:\n{context}"));
    }
    if parts.is_empty() {
        return FALLBACK_INSTRUCTION.to_string();
    }
    parts.join("\n\n")
}
