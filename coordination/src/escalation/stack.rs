//! Escalation stack: LIFO frames of suspended agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::LoadedAgent;

/// Returned by [`EscalationStack::pop`] when nothing is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no escalation to return from")]
pub struct EmptyStack;

/// A suspended agent waiting for control to come back.
#[derive(Debug)]
pub struct EscalationFrame {
    saved: LoadedAgent,
    blocked_node_id: String,
    pushed_at: DateTime<Utc>,
}

impl EscalationFrame {
    pub fn new(saved: LoadedAgent, blocked_node_id: impl Into<String>) -> Self {
        Self {
            saved,
            blocked_node_id: blocked_node_id.into(),
            pushed_at: Utc::now(),
        }
    }

    pub fn saved(&self) -> &LoadedAgent {
        &self.saved
    }

    /// Node to resume on return, if the worker was blocked.
    pub fn blocked_node(&self) -> Option<&str> {
        (!self.blocked_node_id.is_empty()).then_some(self.blocked_node_id.as_str())
    }

    pub fn pushed_at(&self) -> DateTime<Utc> {
        self.pushed_at
    }

    pub fn into_saved(self) -> LoadedAgent {
        self.saved
    }
}

/// NORMAL when empty, ESCALATED otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Escalated,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Push,
    Pop,
    Drain,
}

/// Record of a stack change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    /// Graph of the frame pushed or popped
    pub graph_id: String,
    /// Depth after the change
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct EscalationStack {
    frames: Vec<EscalationFrame>,
    history: Vec<Transition>,
}

impl EscalationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: EscalationFrame) {
        let graph_id = frame.saved().graph_id().to_string();
        self.frames.push(frame);
        self.record(TransitionKind::Push, graph_id);
    }

    pub fn pop(&mut self) -> Result<EscalationFrame, EmptyStack> {
        let frame = self.frames.pop().ok_or(EmptyStack)?;
        self.record(TransitionKind::Pop, frame.saved().graph_id().to_string());
        Ok(frame)
    }

    pub fn peek(&self) -> Option<&EscalationFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn mode(&self) -> Mode {
        if self.frames.is_empty() {
            Mode::Normal
        } else {
            Mode::Escalated
        }
    }

    pub fn can_escalate(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn can_return(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Remove every frame, most recent first.
    pub fn drain_all(&mut self) -> Vec<EscalationFrame> {
        let mut drained = Vec::with_capacity(self.frames.len());
        while let Some(frame) = self.frames.pop() {
            drained.push(frame);
        }
        if !drained.is_empty() {
            self.record(TransitionKind::Drain, String::new());
        }
        drained
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    fn record(&mut self, kind: TransitionKind, graph_id: String) {
        self.history.push(Transition {
            kind,
            graph_id,
            depth: self.frames.len(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockAgentOwner, ScriptedRuntime};
    use std::sync::Arc;

    fn agent(graph: &str) -> LoadedAgent {
        let mut owner = MockAgentOwner::new();
        owner.expect_agent_path().returning(|| None);
        LoadedAgent::new(
            Arc::new(ScriptedRuntime::builder(graph).build()),
            Arc::new(owner),
        )
    }

    #[test]
    fn test_pop_empty_is_error() {
        let mut stack = EscalationStack::new();
        assert_eq!(stack.pop().unwrap_err(), EmptyStack);
        assert_eq!(stack.mode(), Mode::Normal);
        assert!(stack.can_escalate());
        assert!(!stack.can_return());
    }

    #[test]
    fn test_lifo_order() {
        let mut stack = EscalationStack::new();
        stack.push(EscalationFrame::new(agent("worker"), "n1"));
        stack.push(EscalationFrame::new(agent("coder"), ""));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.mode(), Mode::Escalated);
        assert!(!stack.can_escalate());

        let top = stack.pop().unwrap();
        assert_eq!(top.saved().graph_id(), "coder");
        assert_eq!(top.blocked_node(), None);
        let bottom = stack.pop().unwrap();
        assert_eq!(bottom.blocked_node(), Some("n1"));
        assert_eq!(bottom.into_saved().graph_id(), "worker");
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_drain_all_most_recent_first() {
        let mut stack = EscalationStack::new();
        stack.push(EscalationFrame::new(agent("a"), ""));
        stack.push(EscalationFrame::new(agent("b"), ""));
        let graphs: Vec<_> = stack
            .drain_all()
            .iter()
            .map(|f| f.saved().graph_id().to_string())
            .collect();
        assert_eq!(graphs, vec!["b", "a"]);
        assert!(stack.can_escalate());

        let kinds: Vec<_> = stack.history().iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TransitionKind::Push, TransitionKind::Push, TransitionKind::Drain]
        );
    }
}
