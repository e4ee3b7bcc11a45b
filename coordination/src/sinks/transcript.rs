//! Transcript sink
//!
//! The conversational view: streamed model text, tool activity, execution
//! outcomes, input and escalation requests, and (when enabled) one inline log
//! line per non-streaming event.

use std::collections::VecDeque;

use serde_json::Value;

use super::{truncate_chars, SessionUpdate, Sink, SinkError, SinkResult};
use crate::events::{EventSet, EventType, RuntimeEvent};

/// Older lines are dropped past this many.
const MAX_LINES: usize = 500;
const TOOL_RESULT_CHARS: usize = 80;

#[derive(Debug)]
pub struct Transcript {
    lines: VecDeque<String>,
    streaming: String,
    show_logs: bool,
}

impl Transcript {
    pub fn new(show_logs: bool) -> Self {
        Self {
            lines: VecDeque::new(),
            streaming: String::new(),
            show_logs,
        }
    }

    pub fn show_logs(&self) -> bool {
        self.show_logs
    }

    /// Committed lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Text streamed since the last committed line.
    pub fn streaming(&self) -> &str {
        &self.streaming
    }

    fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == MAX_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    fn flush_streaming(&mut self) {
        if !self.streaming.is_empty() {
            let text = std::mem::take(&mut self.streaming);
            self.push(text);
        }
    }

    fn text_delta(&mut self, event: &RuntimeEvent) -> SinkResult<()> {
        match (event.str_field("snapshot"), event.field("content")) {
            (Some(snapshot), _) if !snapshot.is_empty() => {
                self.streaming = snapshot.to_string();
            }
            (_, Some(Value::String(content))) => self.streaming.push_str(content),
            (_, None) => {}
            (_, Some(other)) => {
                return Err(SinkError::MalformedPayload {
                    event_type: event.event_type(),
                    detail: format!("content is not a string: {other}"),
                })
            }
        }
        Ok(())
    }

    fn log_line(event: &RuntimeEvent) -> String {
        match event.node_id() {
            Some(node) => format!("[log] {} node={node}", event.event_type()),
            None => format!("[log] {}", event.event_type()),
        }
    }
}

impl Sink for Transcript {
    fn name(&self) -> &'static str {
        "transcript"
    }

    fn interests(&self) -> EventSet {
        // Inline logs can be switched on after attach.
        EventSet::all()
    }

    fn handle(&mut self, event: &RuntimeEvent) -> SinkResult<()> {
        let node = event.node_or_empty();
        match event.event_type() {
            EventType::LlmTextDelta | EventType::ClientOutputDelta => {
                return self.text_delta(event);
            }
            EventType::ToolCallStarted => {
                self.flush_streaming();
                let tool = event.str_field("tool_name").unwrap_or("unknown");
                self.push(format!("→ {tool}"));
            }
            EventType::ToolCallCompleted => {
                let tool = event.str_field("tool_name").unwrap_or("unknown");
                if event.bool_field("is_error").unwrap_or(false) {
                    let result = event.display_field("result");
                    let result = truncate_chars(&result, TOOL_RESULT_CHARS);
                    self.push(format!("✗ {tool}: {result}"));
                } else {
                    self.push(format!("✓ {tool}"));
                }
            }
            EventType::ExecutionCompleted => {
                self.flush_streaming();
                self.push("Execution completed.");
            }
            EventType::ExecutionFailed => {
                self.flush_streaming();
                let error = event.str_field("error").unwrap_or("Unknown error");
                self.push(format!("Execution failed: {error}"));
            }
            EventType::ClientInputRequested => {
                self.flush_streaming();
                let prompt = event.str_field("prompt").unwrap_or_default();
                if prompt.is_empty() {
                    self.push(format!("{node} is waiting for input"));
                } else {
                    self.push(format!("{node} is waiting for input: {prompt}"));
                }
            }
            EventType::EscalationRequested => {
                self.flush_streaming();
                let reason = event.str_field("reason").unwrap_or_default();
                self.push(format!("Escalation requested: {reason}"));
            }
            EventType::NodeLoopStarted => self.push(format!("▶ {node}")),
            EventType::NodeLoopCompleted => {
                self.flush_streaming();
                self.push(format!("■ {node}"));
            }
            EventType::NodeInternalOutput => {
                let content = event.str_field("content").unwrap_or_default();
                if !content.trim().is_empty() {
                    self.push(format!("[{node}] {content}"));
                }
            }
            EventType::ExecutionPaused => {
                let reason = event.str_field("reason").unwrap_or_default();
                if reason.is_empty() {
                    self.push("Paused.");
                } else {
                    self.push(format!("Paused: {reason}"));
                }
            }
            EventType::ExecutionResumed => self.push("Resumed."),
            EventType::GoalAchieved => self.push("Goal achieved."),
            EventType::ConstraintViolation => {
                let description = event.str_field("description").unwrap_or_default();
                self.push(format!("Constraint violated: {description}"));
            }
            _ => {}
        }

        if self.show_logs && !event.event_type().is_streaming() {
            self.push(Self::log_line(event));
        }
        Ok(())
    }

    fn on_session(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::Returned { target, summary } => {
                self.flush_streaming();
                self.push(format!("Returned from {target}."));
                if let Some(summary) = summary.as_deref().filter(|s| !s.is_empty()) {
                    self.push(summary.to_string());
                }
            }
            SessionUpdate::GraphSwitched { graph_id } => {
                self.flush_streaming();
                self.push(format!("── {graph_id} ──"));
            }
            SessionUpdate::LogsToggled(on) => self.show_logs = *on,
            SessionUpdate::LabelChanged(_) => {}
        }
    }

    fn render(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        if !self.streaming.is_empty() {
            out.push(self.streaming.clone());
        }
        out
    }
}
