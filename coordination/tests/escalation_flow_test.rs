//! Escalation flow tests
//!
//! Drives a [`SessionController`] through escalate / return sequences with
//! scripted runtimes and in-process loader and owner doubles.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::escalation::{EscalationRequest, TransitionKind, DEFAULT_RESUME_MESSAGE};
use coordination::events::{EventType, RuntimeEvent};
use coordination::notify::{RecordingNotifier, Severity};
use coordination::runtime::{
    AgentLoader, AgentOwner, LoadError, LoadRequest, LoadedAgent, ScriptedRuntime,
};
use coordination::session::{
    LoopSignal, SessionCommand, SessionConfig, SessionController, SessionError, Step,
};
use serde_json::{json, Map};
use tokio::sync::Notify;

// ── Doubles ──────────────────────────────────────────────────────────────────

/// Owner that counts teardowns, optionally failing each one.
struct RecordingOwner {
    path: PathBuf,
    teardowns: AtomicUsize,
    fail_teardown: bool,
}

impl RecordingOwner {
    fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(path),
            teardowns: AtomicUsize::new(0),
            fail_teardown: false,
        })
    }

    fn failing(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(path),
            teardowns: AtomicUsize::new(0),
            fail_teardown: true,
        })
    }

    fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentOwner for RecordingOwner {
    fn agent_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            anyhow::bail!("runner already exited");
        }
        Ok(())
    }
}

/// Hands out queued results in order. The first load can be held at a gate.
#[derive(Default)]
struct QueueLoader {
    results: Mutex<VecDeque<Result<LoadedAgent, LoadError>>>,
    requests: Mutex<Vec<LoadRequest>>,
    first_gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl QueueLoader {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            first_gate: Some(gate),
            ..Self::default()
        }
    }

    fn push(&self, result: Result<LoadedAgent, LoadError>) {
        self.results.lock().unwrap().push_back(result);
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentLoader for QueueLoader {
    async fn load(&self, request: LoadRequest) -> Result<LoadedAgent, LoadError> {
        self.requests.lock().unwrap().push(request);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(gate) = &self.first_gate {
                gate.notified().await;
            }
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LoadError::Setup("nothing queued".into())))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const TARGET: &str = "/agents/hive_coder";

fn started(runtime: ScriptedRuntime) -> ScriptedRuntime {
    runtime.start();
    runtime
}

fn agent(runtime: &ScriptedRuntime, owner: &Arc<RecordingOwner>) -> LoadedAgent {
    LoadedAgent::new(Arc::new(runtime.clone()), owner.clone())
}

fn controller(loader: Arc<QueueLoader>) -> (SessionController, RecordingNotifier) {
    let notifier = RecordingNotifier::new();
    let controller =
        SessionController::new(SessionConfig::new(TARGET), loader, Arc::new(notifier.clone()));
    (controller, notifier)
}

/// Process loop steps until `done` holds, failing after five seconds.
async fn run_until(controller: &mut SessionController, done: fn(&SessionController) -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !done(controller) {
            match controller.next_step().await {
                Step::Signal(LoopSignal::Drain) => {
                    controller.handle_drain();
                }
                Step::Signal(LoopSignal::Command(command)) => {
                    let _ = controller.execute(command).await;
                }
                Step::Completed(completion) => {
                    let _ = controller.complete(completion).await;
                }
                Step::Closed => break,
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

// ── Stack discipline ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_n_escalations_then_n_returns_restore_original() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, _notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    let worker_owner = RecordingOwner::new("/agents/inbox");
    controller.install_agent(agent(&worker, &worker_owner)).await;

    let coder_owners: Vec<_> = (0..3).map(|_| RecordingOwner::new(TARGET)).collect();
    for (i, owner) in coder_owners.iter().enumerate() {
        let coder = started(ScriptedRuntime::builder(format!("coder-{i}")).build());
        loader.push(Ok(agent(&coder, owner)));
    }

    for depth in 1..=3 {
        controller
            .escalate(EscalationRequest::new("stuck", "", ""))
            .await
            .unwrap();
        assert_eq!(controller.depth(), depth);
    }
    assert_eq!(controller.active().unwrap().graph_id(), "coder-2");

    for depth in (0..3).rev() {
        controller.return_from_escalation(None).await.unwrap();
        assert_eq!(controller.depth(), depth);
    }

    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(controller.label(), "worker");
    assert!(controller.can_escalate());
    assert!(!controller.can_return());
    assert_eq!(worker.subscriber_count(), 1);
    assert_eq!(worker_owner.teardowns(), 0);
    for owner in &coder_owners {
        assert_eq!(owner.teardowns(), 1);
    }
}

#[tokio::test]
async fn test_nested_escalations_unwind_lifo() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, _notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;

    let first = started(ScriptedRuntime::builder("coder-a").build());
    first.mark_blocked("c1");
    let second = started(ScriptedRuntime::builder("coder-b").build());
    loader.push(Ok(agent(&first, &RecordingOwner::new(TARGET))));
    loader.push(Ok(agent(&second, &RecordingOwner::new(TARGET))));

    controller
        .escalate(EscalationRequest::new("need tool", "", "n1"))
        .await
        .unwrap();
    controller
        .escalate(EscalationRequest::new("need schema", "", "c1"))
        .await
        .unwrap();
    assert_eq!(controller.label(), "coder-b (escalated)");

    controller
        .return_from_escalation(Some("schema added".into()))
        .await
        .unwrap();
    assert_eq!(controller.active().unwrap().graph_id(), "coder-a");
    assert_eq!(controller.label(), "coder-a (escalated)");
    assert_eq!(
        first.injected_inputs(),
        vec![("c1".to_string(), "schema added".to_string())]
    );
    assert!(worker.injected_inputs().is_empty());

    controller.return_from_escalation(None).await.unwrap();
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), DEFAULT_RESUME_MESSAGE.to_string())]
    );

    let kinds: Vec<_> = controller
        .escalation_history()
        .iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Push,
            TransitionKind::Push,
            TransitionKind::Pop,
            TransitionKind::Pop
        ]
    );
}

// ── Failure paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_load_failure_keeps_active_and_depth() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    let coder = started(ScriptedRuntime::builder("coder").build());
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    loader.push(Ok(agent(&coder, &RecordingOwner::new(TARGET))));
    loader.push(Err(LoadError::Setup("model endpoint unreachable".into())));

    controller
        .escalate(EscalationRequest::user_initiated())
        .await
        .unwrap();
    let subscription = controller.subscription();

    let err = controller
        .escalate(EscalationRequest::new("again", "", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Load { .. }));
    assert_eq!(controller.depth(), 1);
    assert_eq!(controller.active().unwrap().graph_id(), "coder");
    assert_eq!(controller.label(), "coder (escalated)");
    assert!(controller.subscription().is_some());
    assert_ne!(controller.subscription(), subscription);
    assert_eq!(coder.subscriber_count(), 1);
    assert_eq!(
        notifier.count_containing("Failed to load hive_coder: agent setup failed"),
        1,
        "{:?}",
        notifier.messages()
    );
}

#[tokio::test]
async fn test_return_without_escalation_is_rejected() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, notifier) = controller(loader);
    let worker = started(ScriptedRuntime::builder("worker").build());
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let subscription = controller.subscription();
    notifier.clear();

    controller
        .signal_sender()
        .send(LoopSignal::Command(SessionCommand::Return { summary: None }))
        .unwrap();
    assert!(controller.pump().await.is_continue());

    assert_eq!(controller.depth(), 0);
    assert_eq!(controller.subscription(), subscription);
    assert_eq!(worker.unsubscribe_calls(), 0);
    assert!(controller.escalation_history().is_empty());
    let notifications = notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Warning);
    assert_eq!(notifications[0].message, "No escalation to return from");
}

// ── Scenario ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tool_missing_escalation_round_trip() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;

    let mut summary = Map::new();
    summary.insert("return_summary".into(), json!("done"));
    let coder = started(
        ScriptedRuntime::builder("hive_coder")
            .completion_data(summary)
            .build(),
    );
    let coder_owner = RecordingOwner::new(TARGET);
    loader.push(Ok(agent(&coder, &coder_owner)));

    // The worker asks for help from its own execution.
    worker.emit(
        RuntimeEvent::new(EventType::EscalationRequested)
            .with_graph("worker")
            .with_node("n1")
            .with_data("reason", "tool X missing"),
    );
    run_until(&mut controller, |c| c.depth() == 1 && !c.has_in_flight()).await;

    let instruction = coder.triggered_inputs()[0]["user_request"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(instruction.contains("tool X missing"));
    assert!(!instruction.contains("Context:"));
    assert!(instruction.contains("/agents/inbox"));

    // The coder's completion carries the summary and triggers the return.
    run_until(&mut controller, |c| c.depth() == 0 && !c.has_in_flight()).await;

    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), "done".to_string())]
    );
    assert_eq!(coder_owner.teardowns(), 1);
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(notifier.count_containing("Returned to worker agent"), 1);
    let transcript = controller
        .snapshot()
        .into_iter()
        .find(|(name, _)| *name == "transcript")
        .map(|(_, lines)| lines)
        .unwrap();
    assert!(transcript.iter().any(|l| l.starts_with("Returned from hive_coder.")));
}

// ── Exclusivity ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_escalate_supersedes_pending_load() {
    let gate = Arc::new(Notify::new());
    let loader = Arc::new(QueueLoader::gated(gate.clone()));
    let (mut controller, _notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let coder = started(ScriptedRuntime::builder("coder").build());
    loader.push(Ok(agent(&coder, &RecordingOwner::new(TARGET))));

    controller
        .begin_escalate(EscalationRequest::new("first", "", ""))
        .await
        .unwrap();
    assert!(controller.is_escalation_pending());
    while loader.request_count() == 0 {
        tokio::task::yield_now().await;
    }

    controller
        .begin_escalate(EscalationRequest::new("second", "", ""))
        .await
        .unwrap();
    controller.settle().await;

    assert_eq!(controller.depth(), 1);
    assert_eq!(controller.active().unwrap().graph_id(), "coder");
    assert_eq!(loader.request_count(), 2);
    let kinds: Vec<_> = controller
        .escalation_history()
        .iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Push,
            TransitionKind::Pop,
            TransitionKind::Push
        ]
    );
}

#[tokio::test]
async fn test_return_while_loading_cancels_escalation() {
    let gate = Arc::new(Notify::new());
    let loader = Arc::new(QueueLoader::gated(gate));
    let (mut controller, notifier) = controller(loader);

    let worker = started(ScriptedRuntime::builder("worker").build());
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;

    controller
        .begin_escalate(EscalationRequest::user_initiated())
        .await
        .unwrap();
    assert_eq!(controller.label(), "Loading hive_coder...");
    assert!(controller.can_return());

    controller.return_from_escalation(None).await.unwrap();
    assert!(!controller.has_in_flight());
    assert_eq!(controller.depth(), 0);
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(controller.label(), "worker");
    assert_eq!(worker.subscriber_count(), 1);
    assert_eq!(notifier.count_containing("Escalation cancelled"), 1);
}

#[tokio::test]
async fn test_escalate_right_after_return_keeps_resume() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, _notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let first = started(ScriptedRuntime::builder("coder-a").build());
    let first_owner = RecordingOwner::new(TARGET);
    loader.push(Ok(agent(&first, &first_owner)));
    let second = started(ScriptedRuntime::builder("coder-b").build());
    loader.push(Ok(agent(&second, &RecordingOwner::new(TARGET))));

    controller
        .escalate(EscalationRequest::new("tool X missing", "", "n1"))
        .await
        .unwrap();
    controller.begin_return(Some("done".into())).await.unwrap();
    controller
        .begin_escalate(EscalationRequest::user_initiated())
        .await
        .unwrap();
    controller.settle().await;

    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), "done".to_string())]
    );
    assert!(!worker.is_blocked("n1"));
    assert_eq!(controller.depth(), 1);
    assert_eq!(controller.active().unwrap().graph_id(), "coder-b");
    assert_eq!(first_owner.teardowns(), 1);
}

#[tokio::test]
async fn test_cancelled_escalation_resumes_blocked_node() {
    let gate = Arc::new(Notify::new());
    let loader = Arc::new(QueueLoader::gated(gate));
    let (mut controller, notifier) = controller(loader);

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;

    controller
        .begin_escalate(EscalationRequest::new("tool X missing", "", "n1"))
        .await
        .unwrap();
    controller.return_from_escalation(None).await.unwrap();

    assert_eq!(controller.depth(), 0);
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), DEFAULT_RESUME_MESSAGE.to_string())]
    );
    assert!(!worker.is_blocked("n1"));
    assert_eq!(notifier.count_containing("Escalation cancelled"), 1);
}

#[tokio::test]
async fn test_superseding_escalation_inherits_blocked_node() {
    let gate = Arc::new(Notify::new());
    let loader = Arc::new(QueueLoader::gated(gate));
    let (mut controller, _notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let coder = started(ScriptedRuntime::builder("coder").build());
    loader.push(Ok(agent(&coder, &RecordingOwner::new(TARGET))));

    controller
        .begin_escalate(EscalationRequest::new("tool X missing", "", "n1"))
        .await
        .unwrap();
    while loader.request_count() == 0 {
        tokio::task::yield_now().await;
    }
    controller
        .escalate(EscalationRequest::user_initiated())
        .await
        .unwrap();
    assert_eq!(controller.depth(), 1);
    assert!(worker.injected_inputs().is_empty());

    controller
        .return_from_escalation(Some("fixed".into()))
        .await
        .unwrap();
    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), "fixed".to_string())]
    );
}

// ── Return error paths ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_return_completes_when_node_not_blocked() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, notifier) = controller(loader.clone());

    // The request names a node, but the worker is not actually blocked on it.
    let worker = started(ScriptedRuntime::builder("worker").build());
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let coder = started(ScriptedRuntime::builder("coder").build());
    let coder_owner = RecordingOwner::new(TARGET);
    loader.push(Ok(agent(&coder, &coder_owner)));

    controller
        .escalate(EscalationRequest::new("tool X missing", "", "n1"))
        .await
        .unwrap();
    controller
        .return_from_escalation(Some("done".into()))
        .await
        .unwrap();

    assert_eq!(controller.depth(), 0);
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(controller.label(), "worker");
    assert_eq!(worker.subscriber_count(), 1);
    assert_eq!(coder_owner.teardowns(), 1);

    let warning = notifier
        .notifications()
        .into_iter()
        .find(|n| n.message.starts_with("Could not resume worker:"))
        .expect("resume warning");
    assert_eq!(warning.severity, Severity::Warning);
    assert!(warning.message.contains("n1"), "{}", warning.message);
    assert_eq!(notifier.count_containing("Returned to worker agent"), 1);
}

#[tokio::test]
async fn test_return_completes_when_teardown_fails() {
    let loader = Arc::new(QueueLoader::default());
    let (mut controller, notifier) = controller(loader.clone());

    let worker = started(ScriptedRuntime::builder("worker").build());
    worker.mark_blocked("n1");
    controller
        .install_agent(agent(&worker, &RecordingOwner::new("/agents/inbox")))
        .await;
    let coder = started(ScriptedRuntime::builder("coder").build());
    let coder_owner = RecordingOwner::failing(TARGET);
    loader.push(Ok(agent(&coder, &coder_owner)));

    controller
        .escalate(EscalationRequest::new("tool X missing", "", "n1"))
        .await
        .unwrap();
    controller.return_from_escalation(None).await.unwrap();

    assert_eq!(coder_owner.teardowns(), 1);
    assert_eq!(controller.depth(), 0);
    assert!(!controller.has_in_flight());
    assert_eq!(controller.active().unwrap().graph_id(), "worker");
    assert_eq!(coder.subscriber_count(), 0);
    assert_eq!(
        worker.injected_inputs(),
        vec![("n1".to_string(), DEFAULT_RESUME_MESSAGE.to_string())]
    );
    assert_eq!(notifier.count_containing("Could not resume worker"), 0);
    assert_eq!(notifier.count_containing("Returned to worker agent"), 1);
}
