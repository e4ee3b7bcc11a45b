//! Commands and wake-ups delivered to the session loop.

use std::path::PathBuf;

use crate::escalation::EscalationRequest;

/// A user action or runtime-originated request for the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Replace the current agent with the one at this location.
    LoadAgent(PathBuf),
    Escalate(EscalationRequest),
    /// The shared escalate/return key: escalate at depth 0, return otherwise.
    ToggleEscalation,
    Return { summary: Option<String> },
    SwitchGraph(String),
    Pause,
    /// Free text: input for a waiting node, or a new request.
    Submit(String),
    ToggleLogs,
    Shutdown,
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadAgent(_) => "load_agent",
            Self::Escalate(_) => "escalate",
            Self::ToggleEscalation => "toggle_escalation",
            Self::Return { .. } => "return",
            Self::SwitchGraph(_) => "switch_graph",
            Self::Pause => "pause",
            Self::Submit(_) => "submit",
            Self::ToggleLogs => "toggle_logs",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What wakes the owning loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// Events are waiting in the router inbox.
    Drain,
    Command(SessionCommand),
}
