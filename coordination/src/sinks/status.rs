//! Status bar sink: graph label, execution state, active node and clock.

use std::time::{Duration, Instant};

use super::{truncate_chars, SessionUpdate, Sink, SinkResult};
use crate::events::{EventSet, EventType, RuntimeEvent};

const FAILED_DETAIL_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "○ idle"),
            Self::Running => write!(f, "● running"),
            Self::Completed => write!(f, "✓ done"),
            Self::Failed => write!(f, "✗ failed"),
        }
    }
}

/// One-line live status.
#[derive(Debug)]
pub struct StatusBar {
    label: String,
    state: ExecutionState,
    active_node: Option<String>,
    detail: String,
    started: Option<Instant>,
    final_elapsed: Option<Duration>,
}

/// `m:ss`, or `h:mm:ss` from one hour on.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, rem) = (total / 3600, total % 3600);
    let (mins, secs) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}:{mins:02}:{secs:02}")
    } else {
        format!("{mins}:{secs:02}")
    }
}

impl StatusBar {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: ExecutionState::Idle,
            active_node: None,
            detail: String::new(),
            started: None,
            final_elapsed: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn active_node(&self) -> Option<&str> {
        self.active_node.as_deref()
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn set_running(&mut self, entry_node: &str) {
        self.state = ExecutionState::Running;
        self.active_node = (!entry_node.is_empty()).then(|| entry_node.to_string());
        self.detail.clear();
        self.started = Some(Instant::now());
        self.final_elapsed = None;
    }

    fn stop_clock(&mut self) {
        if let Some(started) = self.started.take() {
            self.final_elapsed = Some(started.elapsed());
        }
    }

    fn set_detail(&mut self, detail: impl Into<String>) {
        self.detail = detail.into();
    }

    /// The rendered line, parts joined with ` │ `.
    pub fn line(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if !self.label.is_empty() {
            parts.push(self.label.clone());
        }
        parts.push(self.state.to_string());
        if let Some(node) = &self.active_node {
            if self.detail.is_empty() {
                parts.push(node.clone());
            } else {
                parts.push(format!("{node} ({})", self.detail));
            }
        }
        match (self.state, self.started, self.final_elapsed) {
            (ExecutionState::Running, Some(started), _) => {
                parts.push(format_elapsed(started.elapsed()))
            }
            (_, _, Some(elapsed)) => parts.push(format_elapsed(elapsed)),
            _ => {}
        }
        parts.join(" │ ")
    }
}

impl Sink for StatusBar {
    fn name(&self) -> &'static str {
        "status"
    }

    fn interests(&self) -> EventSet {
        EventSet::from_types(&[
            EventType::ExecutionStarted,
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
            EventType::ExecutionPaused,
            EventType::ExecutionResumed,
            EventType::NodeLoopStarted,
            EventType::NodeLoopIteration,
            EventType::NodeStalled,
            EventType::NodeRetry,
            EventType::ToolCallStarted,
            EventType::ToolCallCompleted,
            EventType::ContextCompacted,
            EventType::JudgeVerdict,
            EventType::OutputKeySet,
        ])
    }

    fn handle(&mut self, event: &RuntimeEvent) -> SinkResult<()> {
        match event.event_type() {
            EventType::ExecutionStarted => {
                let entry = event.str_field("entry_node").unwrap_or_default();
                self.set_running(entry);
            }
            EventType::ExecutionCompleted => {
                self.state = ExecutionState::Completed;
                self.stop_clock();
                self.active_node = None;
                self.detail.clear();
            }
            EventType::ExecutionFailed => {
                self.state = ExecutionState::Failed;
                self.stop_clock();
                let error = event.str_field("error").unwrap_or_default();
                self.detail = truncate_chars(error, FAILED_DETAIL_CHARS).to_string();
            }
            EventType::NodeLoopStarted => {
                self.active_node = Some(event.node_or_empty().to_string());
                self.set_detail("thinking...");
            }
            EventType::NodeLoopIteration => {
                self.set_detail(format!("step {}", event.display_field("iteration")));
            }
            EventType::ToolCallStarted => {
                let tool = event.str_field("tool_name").unwrap_or_default();
                self.set_detail(format!("{tool}..."));
            }
            EventType::ToolCallCompleted => self.set_detail("thinking..."),
            EventType::NodeStalled => {
                let reason = event.str_field("reason").unwrap_or_default();
                self.set_detail(format!("stalled: {reason}"));
            }
            EventType::ContextCompacted => {
                self.set_detail(format!(
                    "compacted: {}% → {}%",
                    event.display_field("usage_before"),
                    event.display_field("usage_after")
                ));
            }
            EventType::JudgeVerdict => {
                self.set_detail(format!("judge: {}", event.display_field("action")))
            }
            EventType::OutputKeySet => {
                self.set_detail(format!("set: {}", event.display_field("key")))
            }
            EventType::NodeRetry => {
                self.set_detail(format!(
                    "retry {}/{}",
                    event.display_field("retry_count"),
                    event.display_field("max_retries")
                ));
            }
            EventType::ExecutionPaused => self.set_detail("paused"),
            EventType::ExecutionResumed => self.set_detail("resumed"),
            _ => {}
        }
        Ok(())
    }

    fn on_session(&mut self, update: &SessionUpdate) {
        if let SessionUpdate::LabelChanged(label) = update {
            self.label = label.clone();
        }
    }

    fn render(&self) -> Vec<String> {
        vec![self.line()]
    }
}
