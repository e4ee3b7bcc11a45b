//! Scripted runtime
//!
//! A [`RuntimeHandle`] that replays a fixed list of [`ScriptStep`]s for every
//! execution. Each execution runs on its own worker thread, so events reach
//! subscribers off the owning thread exactly like a real agent runtime.
//! Nodes declared with `await_input` block until [`RuntimeHandle::inject_input`]
//! delivers a value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    EntryPoint, EventHandler, ExecutionId, ExecutionTicket, ExecutionTracker, RuntimeError,
    RuntimeHandle, RuntimeResult, SubscriptionId,
};
use crate::events::{EventSet, EventType, RuntimeEvent};
use crate::notify::lock_unpoisoned;

/// How often blocked or sleeping executions re-check for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One step of an execution script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Emit an event. `graph_id` defaults to the runtime's primary graph.
    Emit {
        #[serde(rename = "type")]
        event_type: EventType,
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        graph_id: Option<String>,
        #[serde(default)]
        data: Map<String, Value>,
    },
    /// Pause the execution.
    Sleep { ms: u64 },
    /// Block `node_id` until input is injected.
    AwaitInput {
        node_id: String,
        #[serde(default)]
        prompt: Option<String>,
    },
}

struct Subscriber {
    id: SubscriptionId,
    event_types: EventSet,
    handler: EventHandler,
}

struct GraphRegistration {
    graph_id: String,
    entry_points: Vec<EntryPoint>,
}

/// Resume channel for a blocked node; `None` when the node was marked
/// blocked without a waiting execution.
type ResumeSender = Option<mpsc::Sender<String>>;

struct Inner {
    graphs: Vec<GraphRegistration>,
    active_graph: Mutex<String>,
    script: Vec<ScriptStep>,
    step_delay: Duration,
    completion_data: Map<String, Value>,
    running: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    unsubscribe_calls: AtomicUsize,
    executions: Mutex<HashMap<String, HashMap<ExecutionId, ExecutionTicket>>>,
    blocked: Mutex<HashMap<String, ResumeSender>>,
    injected: Mutex<Vec<(String, String)>>,
    triggered: Mutex<Vec<Value>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process runtime driven by a script.
#[derive(Clone)]
pub struct ScriptedRuntime {
    graph_id: Arc<str>,
    inner: Arc<Inner>,
}

/// Builder for [`ScriptedRuntime`].
pub struct ScriptedRuntimeBuilder {
    graph_id: String,
    extra_graphs: Vec<String>,
    entry_points: Vec<EntryPoint>,
    script: Vec<ScriptStep>,
    step_delay: Duration,
    completion_data: Map<String, Value>,
}

impl ScriptedRuntimeBuilder {
    /// Register an additional graph sharing this runtime.
    pub fn graph(mut self, graph_id: impl Into<String>) -> Self {
        self.extra_graphs.push(graph_id.into());
        self
    }

    pub fn entry_point(mut self, id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        self.entry_points.push(EntryPoint {
            id: id.into(),
            entry_node: entry_node.into(),
        });
        self
    }

    pub fn script(mut self, steps: Vec<ScriptStep>) -> Self {
        self.script = steps;
        self
    }

    /// Delay after each emitted event, to make playback watchable.
    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Extra fields merged into every EXECUTION_COMPLETED payload.
    pub fn completion_data(mut self, data: Map<String, Value>) -> Self {
        self.completion_data = data;
        self
    }

    pub fn build(self) -> ScriptedRuntime {
        let entry_points = if self.entry_points.is_empty() {
            vec![EntryPoint {
                id: "default".to_string(),
                entry_node: "start".to_string(),
            }]
        } else {
            self.entry_points
        };

        let mut graphs = vec![GraphRegistration {
            graph_id: self.graph_id.clone(),
            entry_points,
        }];
        graphs.extend(self.extra_graphs.into_iter().map(|graph_id| GraphRegistration {
            graph_id,
            entry_points: Vec::new(),
        }));

        ScriptedRuntime {
            graph_id: Arc::from(self.graph_id.as_str()),
            inner: Arc::new(Inner {
                graphs,
                active_graph: Mutex::new(self.graph_id),
                script: self.script,
                step_delay: self.step_delay,
                completion_data: self.completion_data,
                running: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                unsubscribe_calls: AtomicUsize::new(0),
                executions: Mutex::new(HashMap::new()),
                blocked: Mutex::new(HashMap::new()),
                injected: Mutex::new(Vec::new()),
                triggered: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl ScriptedRuntime {
    pub fn builder(graph_id: impl Into<String>) -> ScriptedRuntimeBuilder {
        ScriptedRuntimeBuilder {
            graph_id: graph_id.into(),
            extra_graphs: Vec::new(),
            entry_points: Vec::new(),
            script: Vec::new(),
            step_delay: Duration::ZERO,
            completion_data: Map::new(),
        }
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting triggers and cancel every in-flight execution.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for tickets in lock_unpoisoned(&self.inner.executions).values() {
            for ticket in tickets.values() {
                ticket.request_cancel();
            }
        }
    }

    /// Wait for every worker thread to exit. Blocking; call after [`stop`].
    ///
    /// [`stop`]: ScriptedRuntime::stop
    pub fn join_workers(&self) {
        let workers: Vec<_> = lock_unpoisoned(&self.inner.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!(graph = %self.graph_id, "scripted execution thread panicked");
            }
        }
    }

    /// Emit an event to every matching subscriber on the calling thread.
    pub fn emit(&self, event: RuntimeEvent) {
        self.inner.emit(event);
    }

    /// Mark a node as blocked on input without a running execution.
    pub fn mark_blocked(&self, node_id: impl Into<String>) {
        lock_unpoisoned(&self.inner.blocked).insert(node_id.into(), None);
    }

    pub fn is_blocked(&self, node_id: &str) -> bool {
        lock_unpoisoned(&self.inner.blocked).contains_key(node_id)
    }

    /// Every `inject_input` call, successful or not, in call order.
    pub fn injected_inputs(&self) -> Vec<(String, String)> {
        lock_unpoisoned(&self.inner.injected).clone()
    }

    /// Input payloads of every accepted trigger.
    pub fn triggered_inputs(&self) -> Vec<Value> {
        lock_unpoisoned(&self.inner.triggered).clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner.subscribers).len()
    }

    /// Tickets still registered across all graphs.
    pub fn tracked_executions(&self) -> usize {
        lock_unpoisoned(&self.inner.executions)
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Drop tickets of finished executions and reap their threads.
    fn prune_finished(&self) {
        lock_unpoisoned(&self.inner.executions).retain(|_, tickets| {
            tickets.retain(|_, ticket| !ticket.is_finished());
            !tickets.is_empty()
        });

        let finished: Vec<_> = {
            let mut workers = lock_unpoisoned(&self.inner.workers);
            let (done, running): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(JoinHandle::is_finished);
            *workers = running;
            done
        };
        for worker in finished {
            if worker.join().is_err() {
                warn!(graph = %self.graph_id, "scripted execution thread panicked");
            }
        }
    }

    /// Number of `unsubscribe` calls received, including failed ones.
    pub fn unsubscribe_calls(&self) -> usize {
        self.inner.unsubscribe_calls.load(Ordering::SeqCst)
    }

    fn spawn_execution(&self, execution: Execution) -> RuntimeResult<()> {
        let inner = Arc::clone(&self.inner);
        let primary = self.graph_id.to_string();
        let name = format!("scripted-{}-{}", primary, short_id(&execution.execution_id));
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || inner.run_execution(&primary, execution))
            .map_err(|e| RuntimeError::Other(format!("failed to spawn execution thread: {e}")))?;
        lock_unpoisoned(&self.inner.workers).push(worker);
        Ok(())
    }
}

struct Execution {
    execution_id: ExecutionId,
    entry_node: String,
    input: Value,
    tracker: ExecutionTracker,
}

impl Inner {
    fn emit(&self, event: RuntimeEvent) {
        let handlers: Vec<EventHandler> = lock_unpoisoned(&self.subscribers)
            .iter()
            .filter(|s| s.event_types.contains(event.event_type()))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run_execution(&self, primary: &str, execution: Execution) {
        let Execution {
            execution_id,
            entry_node,
            input,
            tracker,
        } = execution;
        let lifecycle = |event_type: EventType| {
            RuntimeEvent::new(event_type)
                .with_graph(primary)
                .with_data("execution_id", execution_id.clone())
        };

        self.emit(
            lifecycle(EventType::ExecutionStarted)
                .with_data("entry_node", entry_node)
                .with_data("input", input),
        );

        for step in &self.script {
            if tracker.is_cancelled() || !self.is_running() {
                self.emit(lifecycle(EventType::ExecutionPaused).with_data("reason", "cancelled"));
                return;
            }
            let completed = match step {
                ScriptStep::Emit {
                    event_type,
                    node_id,
                    graph_id,
                    data,
                } => {
                    let mut event = RuntimeEvent::new(*event_type)
                        .with_graph(graph_id.as_deref().unwrap_or(primary))
                        .with_payload(data.clone());
                    if let Some(node_id) = node_id {
                        event = event.with_node(node_id.clone());
                    }
                    self.emit(event);
                    sleep_unless_cancelled(self.step_delay, &tracker)
                }
                ScriptStep::Sleep { ms } => {
                    sleep_unless_cancelled(Duration::from_millis(*ms), &tracker)
                }
                ScriptStep::AwaitInput { node_id, prompt } => {
                    self.await_input(primary, node_id, prompt.as_deref(), &tracker)
                }
            };
            if !completed {
                self.emit(lifecycle(EventType::ExecutionPaused).with_data("reason", "cancelled"));
                return;
            }
        }

        let mut completed = lifecycle(EventType::ExecutionCompleted).with_data("output", Map::new());
        for (key, value) in &self.completion_data {
            completed = completed.with_data(key.clone(), value.clone());
        }
        self.emit(completed);
        debug!(graph = primary, execution = %execution_id, "scripted execution completed");
    }

    /// Returns false when cancelled while waiting.
    fn await_input(
        &self,
        primary: &str,
        node_id: &str,
        prompt: Option<&str>,
        tracker: &ExecutionTracker,
    ) -> bool {
        let (resume_tx, resume_rx) = mpsc::channel();
        lock_unpoisoned(&self.blocked).insert(node_id.to_string(), Some(resume_tx));

        self.emit(
            RuntimeEvent::new(EventType::NodeInputBlocked)
                .with_node(node_id)
                .with_graph(primary),
        );
        let mut request = RuntimeEvent::new(EventType::ClientInputRequested)
            .with_node(node_id)
            .with_graph(primary);
        if let Some(prompt) = prompt {
            request = request.with_data("prompt", prompt);
        }
        self.emit(request);

        loop {
            match resume_rx.recv_timeout(POLL_INTERVAL) {
                Ok(message) => {
                    debug!(node = node_id, chars = message.len(), "input received");
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if tracker.is_cancelled() || !self.is_running() {
                        lock_unpoisoned(&self.blocked).remove(node_id);
                        return false;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }
}

fn sleep_unless_cancelled(duration: Duration, tracker: &ExecutionTracker) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if tracker.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn short_id(execution_id: &str) -> &str {
    execution_id.get(..8).unwrap_or(execution_id)
}

#[async_trait]
impl RuntimeHandle for ScriptedRuntime {
    fn graph_id(&self) -> &str {
        &self.graph_id
    }

    fn active_graph_id(&self) -> String {
        lock_unpoisoned(&self.inner.active_graph).clone()
    }

    fn set_active_graph(&self, graph_id: &str) -> RuntimeResult<()> {
        if !self.inner.graphs.iter().any(|g| g.graph_id == graph_id) {
            return Err(RuntimeError::GraphNotFound(graph_id.to_string()));
        }
        *lock_unpoisoned(&self.inner.active_graph) = graph_id.to_string();
        Ok(())
    }

    fn list_graphs(&self) -> Vec<String> {
        self.inner.graphs.iter().map(|g| g.graph_id.clone()).collect()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn entry_points(&self) -> Vec<EntryPoint> {
        self.inner
            .graphs
            .first()
            .map(|g| g.entry_points.clone())
            .unwrap_or_default()
    }

    fn subscribe(
        &self,
        event_types: EventSet,
        handler: EventHandler,
    ) -> RuntimeResult<SubscriptionId> {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock_unpoisoned(&self.inner.subscribers).push(Subscriber {
            id,
            event_types,
            handler,
        });
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> RuntimeResult<()> {
        self.inner.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = lock_unpoisoned(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription);
        if subscribers.len() == before {
            return Err(RuntimeError::SubscriptionNotFound(subscription));
        }
        Ok(())
    }

    async fn trigger(&self, entry_point_id: &str, input_data: Value) -> RuntimeResult<ExecutionId> {
        if !self.inner.is_running() {
            return Err(RuntimeError::Stopped);
        }
        let entry = self
            .entry_points()
            .into_iter()
            .find(|ep| ep.id == entry_point_id)
            .ok_or_else(|| RuntimeError::EntryPointNotFound(entry_point_id.to_string()))?;

        self.prune_finished();
        let execution_id = uuid::Uuid::new_v4().to_string();
        let (ticket, tracker) = ExecutionTicket::new(execution_id.clone(), self.graph_id.as_ref());
        lock_unpoisoned(&self.inner.executions)
            .entry(self.graph_id.to_string())
            .or_default()
            .insert(execution_id.clone(), ticket);
        lock_unpoisoned(&self.inner.triggered).push(input_data.clone());

        self.spawn_execution(Execution {
            execution_id: execution_id.clone(),
            entry_node: entry.entry_node,
            input: input_data,
            tracker,
        })?;
        Ok(execution_id)
    }

    async fn inject_input(&self, node_id: &str, message: &str) -> RuntimeResult<()> {
        lock_unpoisoned(&self.inner.injected).push((node_id.to_string(), message.to_string()));
        let resume = lock_unpoisoned(&self.inner.blocked).remove(node_id);
        match resume {
            Some(Some(sender)) => sender
                .send(message.to_string())
                .map_err(|_| RuntimeError::NotBlocked {
                    node_id: node_id.to_string(),
                }),
            Some(None) => Ok(()),
            None => Err(RuntimeError::NotBlocked {
                node_id: node_id.to_string(),
            }),
        }
    }

    fn find_execution(&self, graph_id: &str, execution_id: &str) -> Option<ExecutionTicket> {
        lock_unpoisoned(&self.inner.executions)
            .get(graph_id)
            .and_then(|tickets| tickets.get(execution_id))
            .cloned()
    }
}
