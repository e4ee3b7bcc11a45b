//! Graph overview sink: execution state and per-node progress for the
//! focused graph.

use std::collections::BTreeMap;

use super::{SessionUpdate, Sink, SinkResult};
use crate::events::{EventSet, EventType, RuntimeEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Running { iteration: u64 },
    Completed,
    Stalled { reason: String },
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { iteration: 0 } => write!(f, "running"),
            Self::Running { iteration } => write!(f, "running (step {iteration})"),
            Self::Completed => write!(f, "done"),
            Self::Stalled { reason } => write!(f, "stalled: {reason}"),
        }
    }
}

#[derive(Debug)]
pub struct GraphOverview {
    graph_id: String,
    execution: &'static str,
    nodes: BTreeMap<String, NodeStatus>,
    tools: BTreeMap<String, Vec<String>>,
    edges: Vec<(String, String)>,
}

impl GraphOverview {
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            execution: "idle",
            nodes: BTreeMap::new(),
            tools: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn node_status(&self, node_id: &str) -> Option<&NodeStatus> {
        self.nodes.get(node_id)
    }

    /// Tools currently running in `node_id`.
    pub fn active_tools(&self, node_id: &str) -> &[String] {
        self.tools.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.tools.clear();
        self.edges.clear();
    }
}

impl Sink for GraphOverview {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn interests(&self) -> EventSet {
        EventSet::from_types(&[
            EventType::ExecutionStarted,
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
            EventType::NodeLoopStarted,
            EventType::NodeLoopIteration,
            EventType::NodeLoopCompleted,
            EventType::NodeStalled,
            EventType::ToolCallStarted,
            EventType::ToolCallCompleted,
            EventType::EdgeTraversed,
        ])
    }

    fn handle(&mut self, event: &RuntimeEvent) -> SinkResult<()> {
        let node = event.node_or_empty().to_string();
        match event.event_type() {
            EventType::ExecutionStarted => {
                self.reset();
                self.execution = "running";
            }
            EventType::ExecutionCompleted => self.execution = "completed",
            EventType::ExecutionFailed => self.execution = "failed",
            EventType::NodeLoopStarted => {
                self.nodes.insert(node, NodeStatus::Running { iteration: 0 });
            }
            EventType::NodeLoopIteration => {
                let iteration = event.u64_field("iteration").unwrap_or(0);
                self.nodes.insert(node, NodeStatus::Running { iteration });
            }
            EventType::NodeLoopCompleted => {
                self.tools.remove(&node);
                self.nodes.insert(node, NodeStatus::Completed);
            }
            EventType::NodeStalled => {
                let reason = event.str_field("reason").unwrap_or_default().to_string();
                self.nodes.insert(node, NodeStatus::Stalled { reason });
            }
            EventType::ToolCallStarted => {
                let tool = event.str_field("tool_name").unwrap_or("unknown");
                self.tools.entry(node).or_default().push(tool.to_string());
            }
            EventType::ToolCallCompleted => {
                let tool = event.str_field("tool_name").unwrap_or("unknown");
                if let Some(running) = self.tools.get_mut(&node) {
                    if let Some(pos) = running.iter().position(|t| t == tool) {
                        running.remove(pos);
                    }
                    if running.is_empty() {
                        self.tools.remove(&node);
                    }
                }
            }
            EventType::EdgeTraversed => {
                let source = event.str_field("source_node").unwrap_or_default();
                let target = event.str_field("target_node").unwrap_or_default();
                self.edges.push((source.to_string(), target.to_string()));
            }
            _ => {}
        }
        Ok(())
    }

    fn on_session(&mut self, update: &SessionUpdate) {
        if let SessionUpdate::GraphSwitched { graph_id } = update {
            self.graph_id = graph_id.clone();
            self.execution = "idle";
            self.reset();
        }
    }

    fn render(&self) -> Vec<String> {
        let mut out = vec![format!("{} [{}]", self.graph_id, self.execution)];
        for (node, status) in &self.nodes {
            let tools = self.active_tools(node);
            if tools.is_empty() {
                out.push(format!("  {node}: {status}"));
            } else {
                out.push(format!("  {node}: {status} [{}]", tools.join(", ")));
            }
        }
        if let Some((source, target)) = self.edges.last() {
            out.push(format!("  last edge: {source} → {target}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lifecycle() {
        let mut view = GraphOverview::new("worker");
        view.handle(&RuntimeEvent::new(EventType::ExecutionStarted)).unwrap();
        view.handle(&RuntimeEvent::new(EventType::NodeLoopStarted).with_node("plan"))
            .unwrap();
        view.handle(
            &RuntimeEvent::new(EventType::NodeLoopIteration)
                .with_node("plan")
                .with_data("iteration", 2),
        )
        .unwrap();
        assert_eq!(
            view.node_status("plan"),
            Some(&NodeStatus::Running { iteration: 2 })
        );

        view.handle(
            &RuntimeEvent::new(EventType::ToolCallStarted)
                .with_node("plan")
                .with_data("tool_name", "grep"),
        )
        .unwrap();
        assert_eq!(view.active_tools("plan"), ["grep".to_string()]);
        assert_eq!(view.render()[1], "  plan: running (step 2) [grep]");

        view.handle(&RuntimeEvent::new(EventType::NodeLoopCompleted).with_node("plan"))
            .unwrap();
        assert_eq!(view.node_status("plan"), Some(&NodeStatus::Completed));
        assert!(view.active_tools("plan").is_empty());
    }

    #[test]
    fn test_edges_and_stall() {
        let mut view = GraphOverview::new("worker");
        view.handle(
            &RuntimeEvent::new(EventType::EdgeTraversed)
                .with_data("source_node", "plan")
                .with_data("target_node", "act"),
        )
        .unwrap();
        view.handle(
            &RuntimeEvent::new(EventType::NodeStalled)
                .with_node("act")
                .with_data("reason", "loop"),
        )
        .unwrap();
        let lines = view.render();
        assert!(lines.contains(&"  act: stalled: loop".to_string()));
        assert_eq!(lines.last().unwrap(), "  last edge: plan → act");
    }

    #[test]
    fn test_graph_switch_resets() {
        let mut view = GraphOverview::new("worker");
        view.handle(&RuntimeEvent::new(EventType::NodeLoopStarted).with_node("plan"))
            .unwrap();
        view.on_session(&SessionUpdate::GraphSwitched {
            graph_id: "monitor".into(),
        });
        assert_eq!(view.graph_id(), "monitor");
        assert_eq!(view.render(), vec!["monitor [idle]"]);
    }
}
