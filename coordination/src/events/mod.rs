//! Event routing for the dashboard
//!
//! Runtime handles emit a closed taxonomy of events from arbitrary threads.
//! This module gets them onto the owning thread, filters out graphs that are
//! not in focus, and fans them out to the mounted sinks.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the 26 event types, the [`EventSet`]
//!    bitset sinks use to declare interest, and the immutable
//!    [`RuntimeEvent`].
//!
//! 2. **Thread Bridge** (`bridge.rs`): the subscription handler. Pushes into
//!    one FIFO inbox and drains it inline on the owning thread or wakes the
//!    owning loop from any other thread.
//!
//! 3. **Event Router** (`router.rs`): subscription lifecycle, background
//!    graph filtering, per-type dispatch to sinks, and escalation commands.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Runtime    │────▶│ ThreadBridge │────▶│    Inbox     │
//! │ (any thread) │     │  (handler)   │     │    (FIFO)    │
//! └──────────────┘     └──────┬───────┘     └──────┬───────┘
//!                             │ direct / queued    │ drain
//!                             ▼                    ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │  LoopSignal  │     │ EventRouter  │────▶ sinks
//!                      │   (wake)     │     │ (owning thr) │────▶ notifier
//!                      └──────────────┘     └──────────────┘
//! ```

pub mod bridge;
pub mod router;
pub mod types;

pub use bridge::{BridgeError, Delivery, DirectPort, QueuedPort, ThreadBridge};
pub use router::{EventRouter, RouterStats};
pub use types::{EventSet, EventType, RuntimeEvent};
