//! Agent session control core
//!
//! This library provides:
//! - A runtime handle contract for running agents (subscribe, trigger,
//!   inject input, cancel) and a scripted in-process implementation
//! - An event router that fans runtime events out to display sinks and
//!   bridges events emitted on runtime threads onto the session thread
//! - An escalation stack that suspends a worker agent, swaps in a helper
//!   agent, and restores the worker on return
//! - A session controller and loop driver tying them together
//!
//! # Layout
//!
//! ```text
//!   runtime ──events──► events::EventRouter ──► sinks (status, transcript, graph)
//!      ▲                      │
//!      │                 SessionCommand
//!      │                      ▼
//!      └──── session::SessionController ◄──► escalation::EscalationStack
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod escalation;
pub mod events;
pub mod notify;
pub mod runtime;
pub mod session;
pub mod sinks;

pub use escalation::{
    build_escalation_input, EmptyStack, EscalationFrame, EscalationRequest, EscalationStack,
    Mode, Transition, TransitionKind,
};
pub use events::{EventRouter, EventSet, EventType, RouterStats, RuntimeEvent};
pub use notify::{ChannelNotifier, Notification, Notifier, RecordingNotifier, Severity};
pub use runtime::{
    AgentLoader, AgentOwner, AgentRole, EntryPoint, EventHandler, ExecutionId, ExecutionTicket,
    ExecutionTracker, GuardianPolicy, LoadError, LoadRequest, LoadedAgent, RuntimeError,
    RuntimeHandle, RuntimeResult, ScriptStep, ScriptedRuntime, SubscriptionId,
};
pub use session::{
    CancelOutcome, LoopSignal, SessionCommand, SessionConfig, SessionController, SessionDriver,
    SessionError, SessionResult,
};
pub use sinks::{default_sinks, DefaultSinks, MountContext, SessionUpdate, Sink, SinkError, SinkFactory};
