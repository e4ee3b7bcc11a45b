//! Event router
//!
//! Owns the sinks mounted for the active handle and the subscription that
//! feeds them. Dispatch happens on the owning thread only, via
//! [`EventRouter::drain`]; the [`ThreadBridge`] decides when that runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace, warn};

use super::bridge::{self, Inbox, ThreadBridge};
use super::{EventSet, EventType, RuntimeEvent};
use crate::escalation::EscalationRequest;
use crate::notify::{lock_unpoisoned, Notification, Notifier};
use crate::runtime::{RuntimeHandle, RuntimeResult, SubscriptionId};
use crate::session::{LoopSignal, SessionCommand, SessionError};
use crate::sinks::{truncate_chars, SessionUpdate, Sink};

const BACKGROUND_ERROR_CHARS: usize = 60;

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Foreground events delivered to sinks
    pub dispatched: u64,
    /// Background events turned into notifications
    pub background_notified: u64,
    /// Background events dropped silently
    pub background_dropped: u64,
    /// Events from a previous subscription
    pub stale_dropped: u64,
    /// Sink errors and panics
    pub sink_failures: u64,
}

type InterestTable = [Vec<usize>; EventType::COUNT];

struct Attachment {
    handle: Arc<dyn RuntimeHandle>,
    subscription: Option<SubscriptionId>,
    generation: u64,
    sinks: Vec<Box<dyn Sink>>,
    interest: InterestTable,
    escalated: bool,
}

pub struct EventRouter {
    bridge_id: u64,
    inbox: Inbox,
    signals: UnboundedSender<LoopSignal>,
    notifier: Arc<dyn Notifier>,
    generation: u64,
    attachment: Option<Attachment>,
    awaiting_input: Option<String>,
    current_execution: Option<String>,
    stats: RouterStats,
}

impl EventRouter {
    /// Create a router owned by the current thread.
    pub fn new(
        signals: UnboundedSender<LoopSignal>,
        notifier: Arc<dyn Notifier>,
    ) -> Rc<RefCell<Self>> {
        let bridge_id = bridge::next_bridge_id();
        let router = Rc::new(RefCell::new(Self {
            bridge_id,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            signals,
            notifier,
            generation: 0,
            attachment: None,
            awaiting_input: None,
            current_execution: None,
            stats: RouterStats::default(),
        }));
        bridge::register(bridge_id, &router);
        router
    }

    /// Subscribe to `handle` and mount `sinks`. Detaches first if attached.
    ///
    /// A failed subscription still mounts the sinks; the error is returned so
    /// the caller can report it.
    pub fn attach(
        &mut self,
        handle: Arc<dyn RuntimeHandle>,
        sinks: Vec<Box<dyn Sink>>,
        escalated: bool,
    ) -> RuntimeResult<()> {
        self.detach();
        self.generation += 1;

        let bridge = ThreadBridge::new(
            self.bridge_id,
            self.generation,
            Arc::clone(&self.inbox),
            self.signals.clone(),
        );
        let (subscription, result) = match handle.subscribe(EventSet::all(), bridge.into_handler())
        {
            Ok(id) => (Some(id), Ok(())),
            Err(e) => {
                warn!(graph = handle.graph_id(), error = %e, "subscription failed; sinks mounted without events");
                (None, Err(e))
            }
        };

        debug!(
            graph = handle.graph_id(),
            generation = self.generation,
            sinks = sinks.len(),
            escalated,
            "router attached"
        );
        self.attachment = Some(Attachment {
            interest: interest_table(&sinks),
            handle,
            subscription,
            generation: self.generation,
            sinks,
            escalated,
        });
        result
    }

    /// Unsubscribe and unmount. Returns false when nothing was attached.
    pub fn detach(&mut self) -> bool {
        let Some(attachment) = self.attachment.take() else {
            return false;
        };
        if let Some(id) = attachment.subscription {
            if let Err(e) = attachment.handle.unsubscribe(id) {
                warn!(graph = attachment.handle.graph_id(), subscription = %id, error = %e, "unsubscribe failed");
            }
        }
        let discarded = {
            let mut inbox = lock_unpoisoned(&self.inbox);
            let discarded = inbox.len();
            inbox.clear();
            discarded
        };
        self.awaiting_input = None;
        self.current_execution = None;
        debug!(
            graph = attachment.handle.graph_id(),
            discarded, "router detached"
        );
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.attachment.as_ref().and_then(|a| a.subscription)
    }

    pub fn sink_count(&self) -> usize {
        self.attachment.as_ref().map_or(0, |a| a.sinks.len())
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Node last seen requesting client input, cleared when taken.
    pub fn take_awaiting_input(&mut self) -> Option<String> {
        self.awaiting_input.take()
    }

    /// Route the next submitted text to `node_id`, e.g. a node still blocked
    /// after a failed escalation.
    pub fn note_awaiting_input(&mut self, node_id: impl Into<String>) {
        self.awaiting_input = Some(node_id.into());
    }

    pub fn awaiting_input(&self) -> Option<&str> {
        self.awaiting_input.as_deref()
    }

    pub fn current_execution(&self) -> Option<&str> {
        self.current_execution.as_deref()
    }

    /// Record an execution started from this session.
    pub fn note_execution(&mut self, execution_id: impl Into<String>) {
        self.current_execution = Some(execution_id.into());
    }

    /// Dispatch everything queued for the current subscription.
    pub fn drain(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            let next = lock_unpoisoned(&self.inbox).pop_front();
            let Some(envelope) = next else {
                break;
            };
            let current = self
                .attachment
                .as_ref()
                .is_some_and(|a| a.generation == envelope.generation);
            if !current {
                self.stats.stale_dropped += 1;
                continue;
            }
            self.dispatch(&envelope.event);
            dispatched += 1;
        }
        dispatched
    }

    /// Tell every mounted sink about a session change.
    pub fn announce(&mut self, update: &SessionUpdate) {
        if let Some(attachment) = self.attachment.as_mut() {
            for sink in attachment.sinks.iter_mut() {
                sink.on_session(update);
            }
        }
    }

    /// Rendered lines per mounted sink, in mount order.
    pub fn snapshot(&self) -> Vec<(&'static str, Vec<String>)> {
        self.attachment
            .as_ref()
            .map(|a| a.sinks.iter().map(|s| (s.name(), s.render())).collect())
            .unwrap_or_default()
    }

    pub fn render(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .flat_map(|(_, lines)| lines)
            .collect()
    }

    fn dispatch(&mut self, event: &RuntimeEvent) {
        let Some(attachment) = self.attachment.as_mut() else {
            return;
        };
        if let Some(graph_id) = event.graph_id() {
            if graph_id != attachment.handle.active_graph_id() {
                self.background(graph_id, event);
                return;
            }
        }

        let escalated = attachment.escalated;
        for &index in &attachment.interest[event.event_type().index()] {
            let sink = &mut attachment.sinks[index];
            match catch_unwind(AssertUnwindSafe(|| sink.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.sink_failures += 1;
                    let e = SessionError::Dispatch(e);
                    warn!(sink = sink.name(), event_type = %event.event_type(), error = %e, "sink dispatch failed");
                }
                Err(panic) => {
                    self.stats.sink_failures += 1;
                    error!(
                        sink = sink.name(),
                        event_type = %event.event_type(),
                        panic = %panic_message(panic.as_ref()),
                        "sink panicked"
                    );
                }
            }
        }
        self.stats.dispatched += 1;
        self.track(event, escalated);
    }

    fn background(&mut self, graph_id: &str, event: &RuntimeEvent) {
        let notification = match event.event_type() {
            EventType::ExecutionFailed => {
                let error = event.str_field("error").unwrap_or("Unknown error");
                let error = truncate_chars(error, BACKGROUND_ERROR_CHARS);
                Notification::error(format!("{graph_id} failed: {error}")).timeout_secs(10)
            }
            EventType::ExecutionCompleted => {
                Notification::information(format!("{graph_id} completed")).timeout_secs(5)
            }
            EventType::ClientInputRequested => {
                Notification::warning(format!("{graph_id} is waiting for input")).timeout_secs(10)
            }
            other => {
                self.stats.background_dropped += 1;
                trace!(graph = graph_id, event_type = %other, "background event dropped");
                return;
            }
        };
        self.stats.background_notified += 1;
        self.notifier.notify(notification);
    }

    /// Session-level bookkeeping after sinks have seen a foreground event.
    fn track(&mut self, event: &RuntimeEvent, escalated: bool) {
        match event.event_type() {
            EventType::ExecutionStarted => {
                if let Some(id) = event.str_field("execution_id") {
                    self.current_execution = Some(id.to_string());
                }
            }
            EventType::ClientInputRequested => {
                let node = event
                    .node_id()
                    .or_else(|| event.str_field("node_id"))
                    .unwrap_or_default();
                self.awaiting_input = Some(node.to_string());
            }
            EventType::ExecutionCompleted | EventType::ExecutionFailed => {
                self.awaiting_input = None;
                if escalated && event.event_type() == EventType::ExecutionCompleted {
                    if let Some(summary) = event.str_field("return_summary") {
                        self.post(SessionCommand::Return {
                            summary: Some(summary.to_string()),
                        });
                    }
                }
            }
            EventType::EscalationRequested => {
                self.post(SessionCommand::Escalate(EscalationRequest::from_event(event)));
            }
            _ => {}
        }
    }

    fn post(&self, command: SessionCommand) {
        if self.signals.send(LoopSignal::Command(command)).is_err() {
            warn!("session loop closed; command dropped");
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.detach();
        bridge::unregister(self.bridge_id);
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("bridge_id", &self.bridge_id)
            .field("generation", &self.generation)
            .field("subscription", &self.subscription())
            .field("sinks", &self.sink_count())
            .field("stats", &self.stats)
            .finish()
    }
}

fn interest_table(sinks: &[Box<dyn Sink>]) -> InterestTable {
    let mut table: InterestTable = std::array::from_fn(|_| Vec::new());
    for (index, sink) in sinks.iter().enumerate() {
        for event_type in sink.interests().iter() {
            table[event_type.index()].push(index);
        }
    }
    table
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
