//! Cancellation tests: pause and bounded shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::events::EventSet;
use coordination::notify::{RecordingNotifier, Severity};
use coordination::runtime::{
    AgentLoader, AgentOwner, EntryPoint, EventHandler, ExecutionId, ExecutionTicket,
    ExecutionTracker, LoadError, LoadRequest, LoadedAgent, RuntimeError, RuntimeHandle,
    RuntimeResult, ScriptStep, ScriptedRuntime, SubscriptionId,
};
use coordination::session::{
    CancelOutcome, LoopSignal, SessionConfig, SessionController, Step,
};
use serde_json::Value;

// ── Doubles ──────────────────────────────────────────────────────────────────

struct NoLoader;

#[async_trait]
impl AgentLoader for NoLoader {
    async fn load(&self, request: LoadRequest) -> Result<LoadedAgent, LoadError> {
        Err(LoadError::Setup(format!(
            "no loader for {}",
            request.agent_path.display()
        )))
    }
}

#[derive(Default)]
struct CountingOwner {
    teardowns: AtomicUsize,
}

#[async_trait]
impl AgentOwner for CountingOwner {
    fn agent_path(&self) -> Option<PathBuf> {
        None
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runtime whose executions ignore cancellation and never finish.
#[derive(Default)]
struct StuckRuntime {
    executions: Mutex<Vec<(ExecutionTicket, ExecutionTracker)>>,
}

impl StuckRuntime {
    fn cancel_requested(&self) -> bool {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .any(|(ticket, _)| ticket.is_cancel_requested())
    }
}

#[async_trait]
impl RuntimeHandle for StuckRuntime {
    fn graph_id(&self) -> &str {
        "stuck"
    }

    fn active_graph_id(&self) -> String {
        "stuck".to_string()
    }

    fn set_active_graph(&self, graph_id: &str) -> RuntimeResult<()> {
        Err(RuntimeError::GraphNotFound(graph_id.to_string()))
    }

    fn list_graphs(&self) -> Vec<String> {
        vec!["stuck".to_string()]
    }

    fn is_running(&self) -> bool {
        true
    }

    fn entry_points(&self) -> Vec<EntryPoint> {
        vec![EntryPoint {
            id: "default".to_string(),
            entry_node: "loop".to_string(),
        }]
    }

    fn subscribe(&self, _types: EventSet, _handler: EventHandler) -> RuntimeResult<SubscriptionId> {
        Ok(SubscriptionId(1))
    }

    fn unsubscribe(&self, _subscription: SubscriptionId) -> RuntimeResult<()> {
        Ok(())
    }

    async fn trigger(&self, _entry_point_id: &str, _input: Value) -> RuntimeResult<ExecutionId> {
        let mut executions = self.executions.lock().unwrap();
        let execution_id = format!("exec-{}", executions.len() + 1);
        executions.push(ExecutionTicket::new(execution_id.clone(), "stuck"));
        Ok(execution_id)
    }

    async fn inject_input(&self, node_id: &str, _message: &str) -> RuntimeResult<()> {
        Err(RuntimeError::NotBlocked {
            node_id: node_id.to_string(),
        })
    }

    fn find_execution(&self, graph_id: &str, execution_id: &str) -> Option<ExecutionTicket> {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .map(|(ticket, _)| ticket)
            .find(|t| t.graph_id() == graph_id && t.execution_id() == execution_id)
            .cloned()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn controller(cancel_timeout: Duration) -> (SessionController, RecordingNotifier) {
    let notifier = RecordingNotifier::new();
    let config = SessionConfig::new("/agents/hive_coder").with_cancel_timeout(cancel_timeout);
    let controller = SessionController::new(config, Arc::new(NoLoader), Arc::new(notifier.clone()));
    (controller, notifier)
}

fn transcript(controller: &SessionController) -> Vec<String> {
    controller
        .snapshot()
        .into_iter()
        .find(|(name, _)| *name == "transcript")
        .map(|(_, lines)| lines)
        .unwrap_or_default()
}

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

// ── Pause ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pause_without_execution_informs() {
    let (mut controller, notifier) = controller(Duration::from_secs(5));
    let runtime = ScriptedRuntime::builder("worker").build();
    controller
        .install_agent(LoadedAgent::new(
            Arc::new(runtime),
            Arc::new(CountingOwner::default()),
        ))
        .await;
    notifier.clear();

    assert_eq!(controller.pause_execution(), CancelOutcome::NoExecution);

    let notifications = notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Information);
    assert_eq!(notifications[0].message, "No active execution to pause");
    assert_eq!(notifications[0].timeout, Duration::from_secs(3));
}

#[tokio::test]
async fn test_pause_cancels_blocked_execution() {
    let (mut controller, notifier) = controller(Duration::from_secs(5));
    let runtime = ScriptedRuntime::builder("worker")
        .script(vec![ScriptStep::AwaitInput {
            node_id: "intake".to_string(),
            prompt: Some("What next?".to_string()),
        }])
        .build();
    runtime.start();
    controller
        .install_agent(LoadedAgent::new(
            Arc::new(runtime.clone()),
            Arc::new(CountingOwner::default()),
        ))
        .await;

    controller.submit("hello").await.unwrap();
    let execution_id = controller.current_execution().unwrap();
    assert_eq!(
        controller.pause_execution(),
        CancelOutcome::Requested(execution_id)
    );
    run_until(&mut controller, |c| {
        transcript(c).iter().any(|line| line == "Paused: cancelled")
    })
    .await;
    assert_eq!(notifier.count_containing("Execution paused - state saved"), 1);

    runtime.join_workers();
    assert_eq!(controller.pause_execution(), CancelOutcome::AlreadyFinished);
    assert_eq!(notifier.count_containing("Execution already completed"), 1);
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_at_most_cancel_timeout() {
    let (mut controller, _notifier) = controller(Duration::from_secs(5));
    let runtime = Arc::new(StuckRuntime::default());
    let owner = Arc::new(CountingOwner::default());
    controller
        .install_agent(LoadedAgent::new(runtime.clone(), owner.clone()))
        .await;
    controller.submit("go").await.unwrap();
    assert_eq!(controller.current_execution().as_deref(), Some("exec-1"));

    let started = tokio::time::Instant::now();
    controller.shutdown().await;
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(5), "waited {waited:?}");
    assert!(waited < Duration::from_secs(6), "waited {waited:?}");
    assert!(runtime.cancel_requested());
    assert_eq!(owner.teardowns.load(Ordering::SeqCst), 1);
    assert!(controller.active().is_none());
    assert!(controller.subscription().is_none());
}

#[tokio::test]
async fn test_shutdown_without_execution_returns_promptly() {
    let (mut controller, _notifier) = controller(Duration::from_secs(30));
    let owner = Arc::new(CountingOwner::default());
    controller
        .install_agent(LoadedAgent::new(
            Arc::new(ScriptedRuntime::builder("worker").build()),
            owner.clone(),
        ))
        .await;

    tokio::time::timeout(Duration::from_secs(1), controller.shutdown())
        .await
        .expect("shutdown should not wait without an execution");
    assert_eq!(owner.teardowns.load(Ordering::SeqCst), 1);
}
