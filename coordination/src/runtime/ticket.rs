//! Execution tickets: cancellation requests and completion observation for
//! one in-flight execution.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::ExecutionId;

/// Observer-side view of an execution, handed out by a runtime's stream
/// registrations.
#[derive(Debug, Clone)]
pub struct ExecutionTicket {
    execution_id: ExecutionId,
    graph_id: String,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Execution-side half: the running execution polls it for cancellation and
/// marks completion. Dropping it also marks the execution finished.
#[derive(Debug)]
pub struct ExecutionTracker {
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl ExecutionTicket {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        graph_id: impl Into<String>,
    ) -> (Self, ExecutionTracker) {
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        let ticket = Self {
            execution_id: execution_id.into(),
            graph_id: graph_id.into(),
            cancel: cancel.clone(),
            finished: finished_rx,
        };
        let tracker = ExecutionTracker {
            cancel,
            finished: finished_tx,
        };
        (ticket, tracker)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Ask the execution to stop. Completion is observed via [`finished`].
    ///
    /// [`finished`]: ExecutionTicket::finished
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the execution has finished (for any reason).
    pub async fn finished(&self) {
        let mut finished = self.finished.clone();
        // A closed channel means the tracker is gone, which also means done.
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl ExecutionTracker {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the execution can select on.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn finish(&self) {
        self.finished.send_replace(true);
    }
}

impl Drop for ExecutionTracker {
    fn drop(&mut self) {
        self.finish();
    }
}
