//! UI sinks
//!
//! A sink is one display surface fed by the event router. Sinks declare the
//! event types they care about, receive matching events synchronously on the
//! owning thread, and return errors instead of panicking. Each attach mounts a
//! fresh set of sinks through a [`SinkFactory`].

pub mod graph_view;
pub mod status;
pub mod transcript;

use crate::events::{EventSet, EventType, RuntimeEvent};

pub use graph_view::GraphOverview;
pub use status::{format_elapsed, StatusBar};
pub use transcript::Transcript;

/// Errors a sink reports back to the router.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("malformed {event_type} payload: {detail}")]
    MalformedPayload { event_type: EventType, detail: String },

    #[error("{0}")]
    Failed(String),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Session-level changes sinks may want to reflect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Control came back from an escalation target.
    Returned {
        target: String,
        summary: Option<String>,
    },
    /// The handle's active graph changed.
    GraphSwitched { graph_id: String },
    /// Inline log lines were switched on or off.
    LogsToggled(bool),
    /// The status label changed.
    LabelChanged(String),
}

/// What a factory knows about the handle it mounts sinks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountContext {
    pub graph_id: String,
    pub label: String,
    pub entry_node: Option<String>,
    pub escalated: bool,
    pub show_logs: bool,
}

/// One display surface.
pub trait Sink {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Event types this sink receives. Read once per attach.
    fn interests(&self) -> EventSet;

    fn handle(&mut self, event: &RuntimeEvent) -> SinkResult<()>;

    fn on_session(&mut self, _update: &SessionUpdate) {}

    /// Current contents as plain text lines.
    fn render(&self) -> Vec<String>;
}

/// Builds the sink set mounted on every attach.
pub trait SinkFactory {
    fn mount(&mut self, ctx: &MountContext) -> Vec<Box<dyn Sink>>;
}

impl<F> SinkFactory for F
where
    F: FnMut(&MountContext) -> Vec<Box<dyn Sink>>,
{
    fn mount(&mut self, ctx: &MountContext) -> Vec<Box<dyn Sink>> {
        self(ctx)
    }
}

/// Status bar, transcript and graph overview, in that order.
pub fn default_sinks(ctx: &MountContext) -> Vec<Box<dyn Sink>> {
    vec![
        Box::new(StatusBar::new(ctx.label.clone())),
        Box::new(Transcript::new(ctx.show_logs)),
        Box::new(GraphOverview::new(ctx.graph_id.clone())),
    ]
}

/// Factory that mounts [`default_sinks`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSinks;

impl SinkFactory for DefaultSinks {
    fn mount(&mut self, ctx: &MountContext) -> Vec<Box<dyn Sink>> {
        default_sinks(ctx)
    }
}

/// Truncate to at most `max` characters, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
