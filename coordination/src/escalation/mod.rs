//! Escalation: suspending the active agent in favour of a fixed helper
//!
//! ```text
//! NORMAL (depth 0)
//!     │  escalate: push frame(worker handle, owner, blocked node)
//!     ▼
//! ESCALATED (depth ≥ 1)
//!     │  escalate again (ESCALATION_REQUESTED from the helper): nest
//!     │  return: pop frame, restore handle, resume blocked node
//!     ▼
//! NORMAL once the last frame is popped
//! ```
//!
//! Frames own the suspended handle and its owner, so a superseded agent
//! stays alive until control comes back to it.

pub mod prompt;
pub mod stack;

pub use prompt::{build_escalation_input, EscalationRequest, DEFAULT_RESUME_MESSAGE};
pub use stack::{EmptyStack, EscalationFrame, EscalationStack, Mode, Transition, TransitionKind};
