//! Session control
//!
//! The [`SessionController`] holds the active agent, the escalation stack
//! and the event router; the [`SessionDriver`] feeds it [`LoopSignal`]s from
//! input readers and runtime threads. Both live on one thread.

pub mod command;
pub mod controller;
pub mod driver;
pub mod error;

pub use command::{LoopSignal, SessionCommand};
pub use controller::{
    CancelOutcome, Completion, PendingEscalation, PendingReturn, ReturnOutcome, SessionConfig,
    SessionController, Step, DEFAULT_CANCEL_TIMEOUT,
};
pub use driver::SessionDriver;
pub use error::{SessionError, SessionResult};
