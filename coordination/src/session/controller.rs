//! Session controller
//!
//! Owns the active agent, the escalation stack and the event router, and
//! performs every transition between them on the owning thread. Loading the
//! escalation target and tearing down the agent left behind by a return run
//! as spawned tasks; at most one of them is in flight, and starting another
//! escalate or return supersedes it. Resuming the worker's blocked node
//! happens inline, so superseding a return never loses the resume.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use super::{LoopSignal, SessionCommand, SessionError, SessionResult};
use crate::escalation::{
    build_escalation_input, EscalationFrame, EscalationRequest, EscalationStack, Mode,
    Transition, DEFAULT_RESUME_MESSAGE,
};
use crate::events::{EventRouter, RouterStats};
use crate::notify::{Notification, Notifier};
use crate::runtime::loader::agent_dir_name;
use crate::runtime::{
    AgentLoader, AgentRole, ExecutionId, GuardianPolicy, LoadError, LoadRequest, LoadedAgent,
    RuntimeError, RuntimeHandle, SubscriptionId,
};
use crate::sinks::{DefaultSinks, MountContext, SessionUpdate, SinkFactory};

/// How long shutdown waits for the current execution to stop.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

// ── SessionConfig ────────────────────────────────────────────────────────────

/// Settings shared by every load in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The fixed helper agent swapped in on escalation.
    pub escalation_target: PathBuf,
    /// Model override applied to every load.
    pub model: Option<String>,
    pub guardian: GuardianPolicy,
    pub cancel_timeout: Duration,
}

impl SessionConfig {
    pub fn new(escalation_target: impl Into<PathBuf>) -> Self {
        Self {
            escalation_target: escalation_target.into(),
            model: None,
            guardian: GuardianPolicy::default(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_guardian(mut self, guardian: GuardianPolicy) -> Self {
        self.guardian = guardian;
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Display name of the escalation target.
    pub fn target_name(&self) -> String {
        agent_dir_name(&self.escalation_target)
            .unwrap_or_else(|| self.escalation_target.display().to_string())
    }

    fn load_request(&self, agent_path: PathBuf, role: AgentRole) -> LoadRequest {
        LoadRequest {
            agent_path,
            model: self.model.clone(),
            guardian: self.guardian,
            role,
        }
    }
}

// ── In-flight operations ─────────────────────────────────────────────────────

/// An escalation whose target is still loading.
#[derive(Debug)]
pub struct PendingEscalation {
    request: EscalationRequest,
    worker_path: Option<PathBuf>,
    target: String,
}

impl PendingEscalation {
    pub fn request(&self) -> &EscalationRequest {
        &self.request
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// A return whose teardown of the outgoing agent is still running.
#[derive(Debug)]
pub struct PendingReturn {
    target: String,
    summary: Option<String>,
    outgoing: Option<LoadedAgent>,
}

/// What the return follow-up did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReturnOutcome {
    /// The outgoing owner was torn down without error.
    pub torn_down: bool,
}

enum InFlight {
    Escalate {
        pending: PendingEscalation,
        task: JoinHandle<Result<LoadedAgent, LoadError>>,
    },
    Return {
        pending: PendingReturn,
        task: JoinHandle<ReturnOutcome>,
    },
}

/// A finished in-flight operation, ready for [`SessionController::complete`].
#[derive(Debug)]
pub enum Completion {
    Escalate {
        pending: PendingEscalation,
        result: Result<Result<LoadedAgent, LoadError>, JoinError>,
    },
    Return {
        pending: PendingReturn,
        result: Result<ReturnOutcome, JoinError>,
    },
}

/// One unit of work for the session loop.
#[derive(Debug)]
pub enum Step {
    Signal(LoopSignal),
    Completed(Completion),
    /// Every signal sender is gone.
    Closed,
}

/// Result of a pause or cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    NoExecution,
    Requested(ExecutionId),
    AlreadyFinished,
}

// ── SessionController ────────────────────────────────────────────────────────

pub struct SessionController {
    config: SessionConfig,
    loader: Arc<dyn AgentLoader>,
    notifier: Arc<dyn Notifier>,
    sinks: Box<dyn SinkFactory>,
    router: Rc<RefCell<EventRouter>>,
    signal_tx: UnboundedSender<LoopSignal>,
    signals: UnboundedReceiver<LoopSignal>,
    active: Option<LoadedAgent>,
    stack: EscalationStack,
    label: String,
    show_logs: bool,
    in_flight: Option<InFlight>,
}

impl SessionController {
    /// Create a controller owned by the current thread, mounting the default
    /// sinks on every attach.
    pub fn new(
        config: SessionConfig,
        loader: Arc<dyn AgentLoader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let router = EventRouter::new(signal_tx.clone(), Arc::clone(&notifier));
        Self {
            config,
            loader,
            notifier,
            sinks: Box::new(DefaultSinks),
            router,
            signal_tx,
            signals,
            active: None,
            stack: EscalationStack::new(),
            label: String::new(),
            show_logs: false,
            in_flight: None,
        }
    }

    /// Mount sinks from `factory` instead of the defaults.
    pub fn with_sinks(mut self, factory: impl SinkFactory + 'static) -> Self {
        self.sinks = Box::new(factory);
        self
    }

    /// Sender for commands from other threads (input readers, signal handlers).
    pub fn signal_sender(&self) -> UnboundedSender<LoopSignal> {
        self.signal_tx.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn active(&self) -> Option<&LoadedAgent> {
        self.active.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn mode(&self) -> Mode {
        self.stack.mode()
    }

    /// Whether the escalate action is available.
    pub fn can_escalate(&self) -> bool {
        self.stack.can_escalate()
    }

    /// Whether the return action is available.
    pub fn can_return(&self) -> bool {
        self.stack.can_return()
    }

    pub fn escalation_history(&self) -> &[Transition] {
        self.stack.history()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn show_logs(&self) -> bool {
        self.show_logs
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_escalation_pending(&self) -> bool {
        matches!(self.in_flight, Some(InFlight::Escalate { .. }))
    }

    /// Node the next submitted text is delivered to.
    pub fn awaiting_input(&self) -> Option<String> {
        self.router.borrow().awaiting_input().map(str::to_string)
    }

    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.router.borrow().current_execution().map(str::to_string)
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.router.borrow().subscription()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.borrow().stats()
    }

    /// Rendered lines per mounted sink.
    pub fn snapshot(&self) -> Vec<(&'static str, Vec<String>)> {
        self.router.borrow().snapshot()
    }

    /// Everything on screen: the sinks when attached, otherwise the label.
    pub fn render_lines(&self) -> Vec<String> {
        let router = self.router.borrow();
        if router.is_attached() {
            router.render()
        } else if self.label.is_empty() {
            Vec::new()
        } else {
            vec![self.label.clone()]
        }
    }

    // ── Loop plumbing ────────────────────────────────────────────────────────

    /// Wait for the next signal or in-flight completion. Cancel-safe.
    pub async fn next_step(&mut self) -> Step {
        tokio::select! {
            signal = self.signals.recv() => match signal {
                Some(signal) => Step::Signal(signal),
                None => Step::Closed,
            },
            Some(done) = take_completion(&mut self.in_flight) => Step::Completed(done),
        }
    }

    /// Wait for the in-flight operation, if any. Cancel-safe.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        take_completion(&mut self.in_flight).await
    }

    /// Dispatch events queued for the current subscription.
    pub fn handle_drain(&mut self) -> usize {
        self.router.borrow_mut().drain()
    }

    /// Drain every queued event without blocking and return the commands
    /// posted meanwhile, in order.
    pub fn drain_events(&mut self) -> Vec<SessionCommand> {
        let mut commands = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                LoopSignal::Drain => {
                    self.handle_drain();
                }
                LoopSignal::Command(command) => commands.push(command),
            }
        }
        self.handle_drain();
        commands
    }

    /// Execute posted commands until none are left, settling each one.
    pub async fn pump(&mut self) -> ControlFlow<()> {
        loop {
            let commands = self.drain_events();
            if commands.is_empty() {
                return ControlFlow::Continue(());
            }
            for command in commands {
                if self.execute(command).await.is_break() {
                    return ControlFlow::Break(());
                }
                self.settle().await;
            }
        }
    }

    /// Run one command. Breaks after shutdown.
    pub async fn execute(&mut self, command: SessionCommand) -> ControlFlow<()> {
        debug!(command = command.name(), depth = self.depth(), "executing command");
        let result = match command {
            SessionCommand::LoadAgent(path) => self.load_agent(path).await,
            SessionCommand::Escalate(request) => self.begin_escalate(request).await,
            SessionCommand::ToggleEscalation => {
                if self.can_return() {
                    self.begin_return(None).await
                } else {
                    self.begin_escalate(EscalationRequest::user_initiated()).await
                }
            }
            SessionCommand::Return { summary } => self.begin_return(summary).await,
            SessionCommand::SwitchGraph(graph_id) => self.switch_graph(&graph_id),
            SessionCommand::Pause => {
                self.pause_execution();
                Ok(())
            }
            SessionCommand::Submit(text) => self.submit(&text).await,
            SessionCommand::ToggleLogs => {
                self.toggle_logs();
                Ok(())
            }
            SessionCommand::Shutdown => {
                self.shutdown().await;
                return ControlFlow::Break(());
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "command finished with error");
        }
        ControlFlow::Continue(())
    }

    /// Apply a finished in-flight operation.
    pub async fn complete(&mut self, completion: Completion) -> SessionResult<()> {
        match completion {
            Completion::Escalate { pending, result } => {
                let result = result.unwrap_or_else(|e| Err(LoadError::Setup(e.to_string())));
                self.finish_escalate(pending, result).await
            }
            Completion::Return { pending, result } => {
                self.finish_return(pending, result).await;
                Ok(())
            }
        }
    }

    /// Await and apply the in-flight operation, if any.
    pub async fn settle(&mut self) {
        while let Some(completion) = self.next_completion().await {
            if let Err(e) = self.complete(completion).await {
                debug!(error = %e, "in-flight operation failed");
            }
        }
    }

    // ── Agent lifecycle ──────────────────────────────────────────────────────

    /// Replace whatever is loaded with `agent`.
    pub async fn install_agent(&mut self, agent: LoadedAgent) {
        self.supersede_in_flight().await;
        self.teardown_all().await;
        let name = agent.name();
        info!(agent = %name, graph = agent.graph_id(), "agent installed");
        self.install(agent);
        self.notifier
            .notify(Notification::information(format!("Agent loaded: {name}")));
    }

    /// Load the agent at `path` and make it active. On failure the session
    /// is left without an agent.
    pub async fn load_agent(&mut self, path: PathBuf) -> SessionResult<()> {
        self.supersede_in_flight().await;
        self.teardown_all().await;

        let name = agent_dir_name(&path).unwrap_or_else(|| path.display().to_string());
        self.set_label(format!("Loading {name}..."));
        let request = self.config.load_request(path, AgentRole::Worker);
        let loader = Arc::clone(&self.loader);
        let result = match tokio::spawn(async move { loader.load(request).await }).await {
            Ok(result) => result,
            Err(e) => Err(LoadError::Setup(e.to_string())),
        };

        match result {
            Ok(agent) => {
                self.install_agent(agent).await;
                Ok(())
            }
            Err(e) => {
                self.label.clear();
                warn!(agent = %name, error = %e, "agent load failed");
                self.notifier
                    .notify(Notification::error(format!("Failed to load agent: {e}")));
                Err(SessionError::Load {
                    target: name,
                    source: e,
                })
            }
        }
    }

    // ── Escalation ───────────────────────────────────────────────────────────

    /// Escalate and wait for the target to load.
    pub async fn escalate(&mut self, request: EscalationRequest) -> SessionResult<()> {
        self.begin_escalate(request).await?;
        match self.next_completion().await {
            Some(completion) => self.complete(completion).await,
            None => Ok(()),
        }
    }

    /// Return and wait for the outgoing agent's teardown to finish.
    pub async fn return_from_escalation(&mut self, summary: Option<String>) -> SessionResult<()> {
        self.begin_return(summary).await?;
        self.settle().await;
        Ok(())
    }

    /// Suspend the active agent and start loading the escalation target.
    ///
    /// A superseded escalation's blocked node carries over to a request
    /// without one; otherwise it is resumed before the new frame is pushed.
    pub async fn begin_escalate(&mut self, mut request: EscalationRequest) -> SessionResult<()> {
        if let Some(node) = self.supersede_in_flight().await {
            if request.node_id.is_empty() {
                request.node_id = node;
            } else if request.node_id != node {
                self.resume_blocked(&node, DEFAULT_RESUME_MESSAGE).await;
            }
        }

        let Some(active) = self.active.take() else {
            self.notifier
                .notify(Notification::error("No active agent to escalate from"));
            return Err(SessionError::NoActiveAgent);
        };
        let worker_path = active.owner.agent_path();
        let target = self.config.target_name();

        self.router.borrow_mut().detach();
        info!(
            from = active.graph_id(),
            escalation_target = %target,
            reason = %request.reason,
            blocked_node = %request.node_id,
            depth = self.stack.depth() + 1,
            "escalating"
        );
        self.stack
            .push(EscalationFrame::new(active, request.node_id.clone()));
        self.set_label(format!("Loading {target}..."));
        self.notifier
            .notify(Notification::information(format!("Escalating to {target}...")));

        let load_request = self.config.load_request(
            self.config.escalation_target.clone(),
            AgentRole::EscalationTarget,
        );
        let loader = Arc::clone(&self.loader);
        let task = tokio::spawn(async move { loader.load(load_request).await });
        self.in_flight = Some(InFlight::Escalate {
            pending: PendingEscalation {
                request,
                worker_path,
                target,
            },
            task,
        });
        Ok(())
    }

    /// Pop the top frame, restore its agent and resume its blocked node. A
    /// return requested while the escalation target is still loading cancels
    /// that escalation instead.
    pub async fn begin_return(&mut self, summary: Option<String>) -> SessionResult<()> {
        if self.is_escalation_pending() {
            if let Some(node) = self.supersede_in_flight().await {
                self.resume_blocked(&node, DEFAULT_RESUME_MESSAGE).await;
            }
            self.notifier
                .notify(Notification::information("Escalation cancelled"));
            return Ok(());
        }
        self.supersede_in_flight().await;

        let frame = match self.stack.pop() {
            Ok(frame) => frame,
            Err(e) => {
                self.notifier
                    .notify(Notification::warning("No escalation to return from"));
                return Err(e.into());
            }
        };

        self.router.borrow_mut().detach();
        let outgoing = self.active.take();
        let target = outgoing
            .as_ref()
            .map(LoadedAgent::name)
            .unwrap_or_else(|| self.config.target_name());
        let blocked = frame.blocked_node().map(str::to_string);
        let escalated_ms = (Utc::now() - frame.pushed_at()).num_milliseconds();
        let restored = frame.into_saved();
        info!(
            to = restored.graph_id(),
            from = %target,
            blocked_node = blocked.as_deref().unwrap_or(""),
            depth = self.stack.depth(),
            escalated_ms,
            "returning from escalation"
        );
        self.install(restored);

        if let Some(node) = blocked {
            let message = summary
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_RESUME_MESSAGE);
            self.resume_blocked(&node, message).await;
        }

        let to_teardown = outgoing.clone();
        let task = tokio::spawn(async move {
            let mut outcome = ReturnOutcome::default();
            if let Some(agent) = to_teardown {
                outcome.torn_down = teardown_best_effort(&agent).await;
            }
            outcome
        });
        self.in_flight = Some(InFlight::Return {
            pending: PendingReturn {
                target,
                summary,
                outgoing,
            },
            task,
        });
        Ok(())
    }

    /// Abort the in-flight operation. A pending escalation is rolled back
    /// (tearing down the target if it finished loading) and the node its
    /// frame suspended is returned; a pending return keeps its state change
    /// and finishes the teardown here.
    pub async fn supersede_in_flight(&mut self) -> Option<String> {
        let in_flight = self.in_flight.take()?;
        match in_flight {
            InFlight::Escalate { pending, task } => {
                task.abort();
                if let Ok(Ok(agent)) = task.await {
                    teardown_best_effort(&agent).await;
                }
                let reason = SessionError::Superseded;
                info!(escalation_target = %pending.target, reason = %reason, "pending escalation rolled back");
                self.rollback_escalation()
            }
            InFlight::Return { pending, task } => {
                task.abort();
                let result = task.await;
                self.finish_return(pending, result).await;
                None
            }
        }
    }

    async fn finish_escalate(
        &mut self,
        pending: PendingEscalation,
        result: Result<LoadedAgent, LoadError>,
    ) -> SessionResult<()> {
        let PendingEscalation {
            request,
            worker_path,
            target,
        } = pending;

        let agent = match result {
            Ok(agent) => agent,
            Err(e) => {
                if let Some(node) = self.rollback_escalation() {
                    self.router.borrow_mut().note_awaiting_input(node);
                }
                warn!(escalation_target = %target, error = %e, "escalation load failed; rolled back");
                self.notifier.notify(
                    Notification::error(format!("Failed to load {target}: {e}")).timeout_secs(10),
                );
                return Err(SessionError::Load { target, source: e });
            }
        };

        let handle = Arc::clone(&agent.handle);
        self.install(agent);

        let instruction =
            build_escalation_input(&request.reason, &request.context, worker_path.as_deref());
        if let Err(e) = self
            .trigger_default(&handle, json!({ "user_request": instruction }))
            .await
        {
            warn!(escalation_target = %target, error = %e, "escalation target did not start");
            self.notifier
                .notify(Notification::error(format!("Error starting {target}: {e}")));
        }
        self.notifier.notify(
            Notification::information(format!("{target} loaded. Ctrl+E or /back to return."))
                .timeout_secs(5),
        );
        Ok(())
    }

    async fn finish_return(&mut self, pending: PendingReturn, result: Result<ReturnOutcome, JoinError>) {
        let PendingReturn {
            target,
            summary,
            outgoing,
        } = pending;

        match result {
            Ok(outcome) => {
                debug!(from = %target, torn_down = outcome.torn_down, "return follow-up finished");
            }
            Err(e) => {
                warn!(error = %e, "return follow-up interrupted");
                if let Some(agent) = outgoing {
                    teardown_best_effort(&agent).await;
                }
            }
        }

        self.router
            .borrow_mut()
            .announce(&SessionUpdate::Returned { target, summary });
        self.notifier
            .notify(Notification::information("Returned to worker agent"));
    }

    /// Pop the frame pushed by a failed or cancelled escalation and restore
    /// its agent. Returns the node the frame left blocked.
    fn rollback_escalation(&mut self) -> Option<String> {
        match self.stack.pop() {
            Ok(frame) => {
                let blocked = frame.blocked_node().map(str::to_string);
                self.install(frame.into_saved());
                blocked
            }
            Err(e) => {
                warn!(error = %e, "nothing to roll back");
                None
            }
        }
    }

    /// Deliver `message` to a blocked node of the active agent. Failure is
    /// reported to the user, never propagated.
    async fn resume_blocked(&self, node_id: &str, message: &str) -> bool {
        let Some(handle) = self.active.as_ref().map(|a| Arc::clone(&a.handle)) else {
            return false;
        };
        match handle.inject_input(node_id, message).await {
            Ok(()) => {
                debug!(node = node_id, graph = handle.graph_id(), "worker resumed");
                true
            }
            Err(e) => {
                warn!(node = node_id, error = %e, "could not resume worker");
                self.notifier.notify(
                    Notification::warning(format!("Could not resume worker: {e}"))
                        .timeout_secs(5),
                );
                false
            }
        }
    }

    // ── Other operations ─────────────────────────────────────────────────────

    /// Focus another graph of the active handle.
    pub fn switch_graph(&mut self, graph_id: &str) -> SessionResult<()> {
        let Some(agent) = self.active.as_ref() else {
            return Err(SessionError::NoActiveAgent);
        };
        if let Err(e) = agent.handle.set_active_graph(graph_id) {
            self.notifier.notify(
                Notification::error(format!("Graph '{graph_id}' not found")).timeout_secs(3),
            );
            return Err(e.into());
        }
        let label = self.label_for(agent);
        self.label = label.clone();
        {
            let mut router = self.router.borrow_mut();
            router.announce(&SessionUpdate::GraphSwitched {
                graph_id: graph_id.to_string(),
            });
            router.announce(&SessionUpdate::LabelChanged(label));
        }
        self.notifier.notify(
            Notification::information(format!("Switched to graph: {graph_id}")).timeout_secs(3),
        );
        Ok(())
    }

    /// Request cancellation of the current execution without waiting.
    pub fn pause_execution(&mut self) -> CancelOutcome {
        let execution = self.current_execution();
        let (Some(agent), Some(execution_id)) = (self.active.as_ref(), execution) else {
            self.notifier.notify(
                Notification::information("No active execution to pause").timeout_secs(3),
            );
            return CancelOutcome::NoExecution;
        };
        if agent.handle.cancel(&execution_id) {
            info!(execution = %execution_id, "execution paused");
            self.notifier.notify(
                Notification::information("Execution paused - state saved").timeout_secs(3),
            );
            CancelOutcome::Requested(execution_id)
        } else {
            self.notifier.notify(
                Notification::information("Execution already completed").timeout_secs(2),
            );
            CancelOutcome::AlreadyFinished
        }
    }

    /// Cancel the current execution and wait up to the configured timeout.
    /// A timeout is logged, not reported as failure.
    pub async fn cancel_execution(&self) -> CancelOutcome {
        let (Some(agent), Some(execution_id)) = (self.active.as_ref(), self.current_execution())
        else {
            return CancelOutcome::NoExecution;
        };
        let Some(ticket) = agent.handle.locate_execution(&execution_id) else {
            return CancelOutcome::AlreadyFinished;
        };
        ticket.request_cancel();
        let timeout = self.config.cancel_timeout;
        if tokio::time::timeout(timeout, ticket.finished()).await.is_err() {
            warn!(
                execution = %execution_id,
                timeout_ms = timeout.as_millis() as u64,
                "execution did not stop before timeout"
            );
        }
        CancelOutcome::Requested(execution_id)
    }

    /// Deliver text to the node awaiting input, or start a new request on
    /// the default entry point.
    pub async fn submit(&mut self, text: &str) -> SessionResult<()> {
        let Some(handle) = self.active.as_ref().map(|a| Arc::clone(&a.handle)) else {
            self.notifier.notify(Notification::warning("No agent loaded"));
            return Err(SessionError::NoActiveAgent);
        };

        let awaiting = self.router.borrow_mut().take_awaiting_input();
        if let Some(node) = awaiting.filter(|node| !node.is_empty()) {
            return match handle.inject_input(&node, text).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.notifier
                        .notify(Notification::error(format!("Could not deliver input: {e}")));
                    Err(e.into())
                }
            };
        }

        match self
            .trigger_default(&handle, json!({ "user_request": text }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.notifier.notify(Notification::error(format!(
                    "Error starting {}: {e}",
                    handle.graph_id()
                )));
                Err(e.into())
            }
        }
    }

    /// Flip inline log lines in the transcript. Returns the new state.
    pub fn toggle_logs(&mut self) -> bool {
        self.show_logs = !self.show_logs;
        self.router
            .borrow_mut()
            .announce(&SessionUpdate::LogsToggled(self.show_logs));
        let mode = if self.show_logs { "ON" } else { "OFF" };
        self.notifier
            .notify(Notification::information(format!("Logs {mode}")).timeout_secs(2));
        self.show_logs
    }

    /// Stop the current execution (bounded wait), abort in-flight work, and
    /// tear down every agent this session owns.
    pub async fn shutdown(&mut self) {
        info!(depth = self.depth(), "session shutting down");
        self.cancel_execution().await;
        self.supersede_in_flight().await;
        self.teardown_all().await;
        self.label.clear();
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn install(&mut self, agent: LoadedAgent) {
        self.label = self.label_for(&agent);
        self.active = Some(agent);
        self.attach_active();
    }

    fn attach_active(&mut self) {
        let Some(agent) = self.active.as_ref() else {
            return;
        };
        let escalated = self.stack.depth() > 0;
        let ctx = MountContext {
            graph_id: agent.handle.active_graph_id(),
            label: self.label.clone(),
            entry_node: agent
                .handle
                .entry_points()
                .first()
                .map(|ep| ep.entry_node.clone()),
            escalated,
            show_logs: self.show_logs,
        };
        let sinks = self.sinks.mount(&ctx);
        let attached = self
            .router
            .borrow_mut()
            .attach(Arc::clone(&agent.handle), sinks, escalated);
        if let Err(e) = attached {
            let e = SessionError::Subscription(e);
            warn!(graph = agent.graph_id(), error = %e, "attach incomplete");
            self.notifier.notify(Notification::error(e.to_string()));
        }
    }

    fn label_for(&self, agent: &LoadedAgent) -> String {
        let graph = agent.handle.active_graph_id();
        if self.stack.depth() > 0 {
            format!("{graph} (escalated)")
        } else {
            graph
        }
    }

    fn set_label(&mut self, label: String) {
        self.router
            .borrow_mut()
            .announce(&SessionUpdate::LabelChanged(label.clone()));
        self.label = label;
    }

    async fn trigger_default(
        &mut self,
        handle: &Arc<dyn RuntimeHandle>,
        input: Value,
    ) -> Result<ExecutionId, RuntimeError> {
        let entry = handle
            .entry_points()
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::EntryPointNotFound("default".to_string()))?;
        let execution_id = handle.trigger(&entry.id, input).await?;
        debug!(graph = handle.graph_id(), execution = %execution_id, entry = %entry.id, "triggered");
        self.router.borrow_mut().note_execution(execution_id.clone());
        Ok(execution_id)
    }

    /// Detach and tear down the active agent and every stacked one.
    async fn teardown_all(&mut self) {
        self.router.borrow_mut().detach();
        let mut agents = Vec::new();
        agents.extend(self.active.take());
        agents.extend(
            self.stack
                .drain_all()
                .into_iter()
                .map(EscalationFrame::into_saved),
        );
        for agent in &agents {
            teardown_best_effort(agent).await;
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("active", &self.active)
            .field("depth", &self.stack.depth())
            .field("label", &self.label)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

async fn take_completion(in_flight: &mut Option<InFlight>) -> Option<Completion> {
    match in_flight.as_mut()? {
        InFlight::Escalate { task, .. } => {
            let result = task.await;
            match in_flight.take() {
                Some(InFlight::Escalate { pending, .. }) => {
                    Some(Completion::Escalate { pending, result })
                }
                _ => None,
            }
        }
        InFlight::Return { task, .. } => {
            let result = task.await;
            match in_flight.take() {
                Some(InFlight::Return { pending, .. }) => Some(Completion::Return { pending, result }),
                _ => None,
            }
        }
    }
}

async fn teardown_best_effort(agent: &LoadedAgent) -> bool {
    match agent.owner.teardown().await {
        Ok(()) => {
            debug!(graph = agent.graph_id(), "agent torn down");
            true
        }
        Err(e) => {
            warn!(graph = agent.graph_id(), error = %e, "teardown failed; ignoring");
            false
        }
    }
}
