//! Session loop driver.
//!
//! ```text
//!   input thread ──Command──┐
//!   runtime threads ─Drain──┼──► signals ──► next_step ──► execute / drain / complete
//!   loader task ──finished──┘                    │
//!                                                └──► after_step (render)
//! ```

use std::ops::ControlFlow;

use tracing::{debug, info};

use super::controller::{SessionController, Step};
use super::LoopSignal;

/// Runs a [`SessionController`] until shutdown or until every signal sender
/// is gone.
#[derive(Debug)]
pub struct SessionDriver {
    controller: SessionController,
}

impl SessionDriver {
    pub fn new(controller: SessionController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SessionController {
        &mut self.controller
    }

    pub fn into_controller(self) -> SessionController {
        self.controller
    }

    /// Process signals and completions in arrival order. `after_step` runs
    /// once per processed step, on the owning thread.
    pub async fn run(&mut self, mut after_step: impl FnMut(&SessionController)) {
        info!("session loop started");
        let mut steps = 0u64;
        loop {
            let step = self.controller.next_step().await;
            steps += 1;
            let flow = match step {
                Step::Signal(LoopSignal::Drain) => {
                    self.controller.handle_drain();
                    ControlFlow::Continue(())
                }
                Step::Signal(LoopSignal::Command(command)) => {
                    self.controller.execute(command).await
                }
                Step::Completed(completion) => {
                    if let Err(e) = self.controller.complete(completion).await {
                        debug!(error = %e, "in-flight operation failed");
                    }
                    ControlFlow::Continue(())
                }
                Step::Closed => {
                    self.controller.shutdown().await;
                    ControlFlow::Break(())
                }
            };
            after_step(&self.controller);
            if flow.is_break() {
                break;
            }
        }
        info!(steps, "session loop stopped");
    }
}
