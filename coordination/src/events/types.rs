//! Runtime event taxonomy
//!
//! The closed set of events a runtime handle emits and the router consumes.
//! Payload schemas vary per type and are carried as a JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every event type the dashboard understands.
///
/// Declaration order is significant: [`EventType::index`] is the
/// discriminant and indexes the router's interest table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Execution lifecycle
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    ExecutionResumed,
    // Node lifecycle
    NodeLoopStarted,
    NodeLoopIteration,
    NodeLoopCompleted,
    NodeStalled,
    NodeRetry,
    NodeInputBlocked,
    NodeInternalOutput,
    // Streaming output
    LlmTextDelta,
    ClientOutputDelta,
    // Tool invocation
    ToolCallStarted,
    ToolCallCompleted,
    // Input coordination
    ClientInputRequested,
    // Escalation
    EscalationRequested,
    // Auxiliary telemetry
    ContextCompacted,
    JudgeVerdict,
    OutputKeySet,
    GoalProgress,
    GoalAchieved,
    ConstraintViolation,
    EdgeTraversed,
    StateChanged,
}

impl EventType {
    /// Number of event types.
    pub const COUNT: usize = 26;

    /// All event types in declaration order.
    pub const ALL: [EventType; EventType::COUNT] = [
        EventType::ExecutionStarted,
        EventType::ExecutionCompleted,
        EventType::ExecutionFailed,
        EventType::ExecutionPaused,
        EventType::ExecutionResumed,
        EventType::NodeLoopStarted,
        EventType::NodeLoopIteration,
        EventType::NodeLoopCompleted,
        EventType::NodeStalled,
        EventType::NodeRetry,
        EventType::NodeInputBlocked,
        EventType::NodeInternalOutput,
        EventType::LlmTextDelta,
        EventType::ClientOutputDelta,
        EventType::ToolCallStarted,
        EventType::ToolCallCompleted,
        EventType::ClientInputRequested,
        EventType::EscalationRequested,
        EventType::ContextCompacted,
        EventType::JudgeVerdict,
        EventType::OutputKeySet,
        EventType::GoalProgress,
        EventType::GoalAchieved,
        EventType::ConstraintViolation,
        EventType::EdgeTraversed,
        EventType::StateChanged,
    ];

    /// Position of this type in [`EventType::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
            Self::NodeLoopStarted => "node_loop_started",
            Self::NodeLoopIteration => "node_loop_iteration",
            Self::NodeLoopCompleted => "node_loop_completed",
            Self::NodeStalled => "node_stalled",
            Self::NodeRetry => "node_retry",
            Self::NodeInputBlocked => "node_input_blocked",
            Self::NodeInternalOutput => "node_internal_output",
            Self::LlmTextDelta => "llm_text_delta",
            Self::ClientOutputDelta => "client_output_delta",
            Self::ToolCallStarted => "tool_call_started",
            Self::ToolCallCompleted => "tool_call_completed",
            Self::ClientInputRequested => "client_input_requested",
            Self::EscalationRequested => "escalation_requested",
            Self::ContextCompacted => "context_compacted",
            Self::JudgeVerdict => "judge_verdict",
            Self::OutputKeySet => "output_key_set",
            Self::GoalProgress => "goal_progress",
            Self::GoalAchieved => "goal_achieved",
            Self::ConstraintViolation => "constraint_violation",
            Self::EdgeTraversed => "edge_traversed",
            Self::StateChanged => "state_changed",
        }
    }

    /// Token-level streaming output.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::LlmTextDelta | Self::ClientOutputDelta)
    }

    /// Types still surfaced (as notifications) when they come from a
    /// graph that is not in focus.
    pub fn is_background_notable(self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed | Self::ExecutionCompleted | Self::ClientInputRequested
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact set of [`EventType`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every event type.
    pub const fn all() -> Self {
        Self((1u32 << EventType::COUNT as u32) - 1)
    }

    pub fn from_types(types: &[EventType]) -> Self {
        types.iter().copied().collect()
    }

    pub fn with(mut self, event_type: EventType) -> Self {
        self.0 |= 1 << event_type.index();
        self
    }

    pub fn without(mut self, event_type: EventType) -> Self {
        self.0 &= !(1 << event_type.index());
        self
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        self.0 & (1 << event_type.index()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = EventType> + '_ {
        EventType::ALL
            .iter()
            .copied()
            .filter(move |event_type| self.contains(*event_type))
    }
}

impl FromIterator<EventType> for EventSet {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), EventSet::with)
    }
}

/// A single event emitted by a runtime handle.
///
/// Built once through the `with_*` constructors and never mutated after it
/// is handed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    graph_id: Option<String>,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            node_id: None,
            graph_id: None,
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Node id, or the empty string for graph-level events.
    pub fn node_or_empty(&self) -> &str {
        self.node_id.as_deref().unwrap_or("")
    }

    pub fn graph_id(&self) -> Option<&str> {
        self.graph_id.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// Render a field for display; strings are shown without quotes and
    /// missing fields as `?`.
    pub fn display_field(&self, key: &str) -> String {
        match self.data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "?".to_string(),
        }
    }
}
