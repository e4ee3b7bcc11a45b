//! Thread bridge between runtime handlers and the owning loop
//!
//! Runtime handles call subscription handlers from any thread. Every event
//! goes into one FIFO inbox owned by the router; what happens next depends
//! on the calling thread:
//!
//! - **direct port**: on the owning thread the inbox is drained inline,
//!   unless the router is already borrowed (a drain or attach is in
//!   progress), in which case the event stays queued for that drain or for
//!   the loop.
//! - **queued port**: on any other thread the owning loop is woken with
//!   [`LoopSignal::Drain`] when the inbox goes from empty to non-empty.
//!
//! A single inbox keeps per-handle emission order on both paths.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, trace};

use super::router::EventRouter;
use super::RuntimeEvent;
use crate::notify::lock_unpoisoned;
use crate::runtime::EventHandler;
use crate::session::LoopSignal;

/// Bridge failures. Logged, never surfaced to callers of the handler.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("owning loop is unavailable; dropped {dropped} queued event(s)")]
    OwnerUnavailable { dropped: usize },
}

/// An event tagged with the subscription generation it arrived under.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) generation: u64,
    pub(crate) event: RuntimeEvent,
}

pub(crate) type Inbox = Arc<Mutex<VecDeque<Envelope>>>;

/// Outcome of an inline drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Drained,
    Deferred,
}

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ROUTERS: RefCell<HashMap<u64, Weak<RefCell<EventRouter>>>> =
        RefCell::new(HashMap::new());
}

pub(crate) fn next_bridge_id() -> u64 {
    NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Make `router` reachable from direct ports on the current thread.
pub(crate) fn register(bridge_id: u64, router: &Rc<RefCell<EventRouter>>) {
    ROUTERS.with(|routers| {
        routers
            .borrow_mut()
            .insert(bridge_id, Rc::downgrade(router));
    });
}

pub(crate) fn unregister(bridge_id: u64) {
    // Thread-local storage may already be gone during thread teardown.
    let _ = ROUTERS.try_with(|routers| {
        if let Ok(mut routers) = routers.try_borrow_mut() {
            routers.remove(&bridge_id);
        }
    });
}

/// Owning-thread path: drain inline through the thread-local registry.
#[derive(Debug, Clone, Copy)]
pub struct DirectPort {
    bridge_id: u64,
}

impl DirectPort {
    pub fn drain(&self) -> Delivery {
        let router = ROUTERS
            .try_with(|routers| {
                routers
                    .try_borrow()
                    .ok()
                    .and_then(|routers| routers.get(&self.bridge_id).and_then(Weak::upgrade))
            })
            .ok()
            .flatten();
        let Some(router) = router else {
            return Delivery::Deferred;
        };
        let drained = match router.try_borrow_mut() {
            Ok(mut router) => router.drain(),
            Err(_) => return Delivery::Deferred,
        };
        trace!(drained, "direct drain");
        Delivery::Drained
    }
}

/// Cross-thread path: wake the owning loop.
#[derive(Debug, Clone)]
pub struct QueuedPort {
    inbox: Inbox,
    signals: UnboundedSender<LoopSignal>,
}

impl QueuedPort {
    pub fn wake(&self) {
        if self.signals.send(LoopSignal::Drain).is_err() {
            let dropped = {
                let mut inbox = lock_unpoisoned(&self.inbox);
                let dropped = inbox.len();
                inbox.clear();
                dropped
            };
            let e = BridgeError::OwnerUnavailable { dropped };
            error!(error = %e, "event delivery failed");
        }
    }
}

/// Per-subscription entry point handed to the runtime handle.
#[derive(Debug, Clone)]
pub struct ThreadBridge {
    owner: ThreadId,
    generation: u64,
    inbox: Inbox,
    direct: DirectPort,
    queued: QueuedPort,
}

impl ThreadBridge {
    pub(crate) fn new(
        bridge_id: u64,
        generation: u64,
        inbox: Inbox,
        signals: UnboundedSender<LoopSignal>,
    ) -> Self {
        Self {
            owner: thread::current().id(),
            generation,
            inbox: Arc::clone(&inbox),
            direct: DirectPort { bridge_id },
            queued: QueuedPort { inbox, signals },
        }
    }

    pub fn is_owning_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Enqueue `event` and get it drained, inline or by the loop.
    pub fn deliver(&self, event: RuntimeEvent) {
        let was_empty = {
            let mut inbox = lock_unpoisoned(&self.inbox);
            let was_empty = inbox.is_empty();
            inbox.push_back(Envelope {
                generation: self.generation,
                event,
            });
            was_empty
        };

        if self.is_owning_thread() && self.direct.drain() == Delivery::Drained {
            return;
        }
        if was_empty {
            self.queued.wake();
        }
    }

    /// Subscription handler that forwards into this bridge.
    pub fn into_handler(self) -> EventHandler {
        Arc::new(move |event| self.deliver(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use tokio::sync::mpsc;

    fn inbox() -> Inbox {
        Arc::new(Mutex::new(VecDeque::new()))
    }

    #[test]
    fn test_unregistered_router_falls_back_to_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = inbox();
        let bridge = ThreadBridge::new(next_bridge_id(), 1, Arc::clone(&queue), tx);

        bridge.deliver(RuntimeEvent::new(EventType::GoalProgress));
        bridge.deliver(RuntimeEvent::new(EventType::GoalAchieved));

        assert_eq!(lock_unpoisoned(&queue).len(), 2);
        assert!(matches!(rx.try_recv(), Ok(LoopSignal::Drain)));
        assert!(rx.try_recv().is_err(), "only the first push wakes the loop");
    }

    #[test]
    fn test_worker_thread_uses_queued_port() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = inbox();
        let bridge = ThreadBridge::new(next_bridge_id(), 7, Arc::clone(&queue), tx);
        assert!(bridge.is_owning_thread());

        let handler = bridge.into_handler();
        thread::spawn(move || handler(RuntimeEvent::new(EventType::StateChanged)))
            .join()
            .unwrap();

        let queued = lock_unpoisoned(&queue);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].generation, 7);
        assert!(matches!(rx.try_recv(), Ok(LoopSignal::Drain)));
    }

    #[test]
    fn test_closed_loop_drops_queued_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let queue = inbox();
        let bridge = ThreadBridge::new(next_bridge_id(), 1, Arc::clone(&queue), tx);

        bridge.deliver(RuntimeEvent::new(EventType::GoalProgress));
        assert!(lock_unpoisoned(&queue).is_empty());
    }
}
