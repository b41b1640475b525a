use std::sync::Arc;

use tokio::task::JoinHandle;
use tr_harness::process::ProcessRegistry;
use tr_harness::shutdown::ShutdownSignal;
use tracing::{debug, error, info};

use crate::context::TaskRunGuard;
use crate::dispatcher::Dispatcher;

/// How a task unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Shutdown interrupted the unit. Not an error.
    Cancelled,
    Failed(String),
}

/// Run one fetch-and-execute pass on its own tokio task.
///
/// The unit owns `guard`, so the task flag is cleared however the unit ends,
/// panics included. Cancellation is observed both by the dispatcher and by
/// the unit itself.
pub fn launch(
    dispatcher: Arc<dyn Dispatcher>,
    guard: TaskRunGuard,
    shutdown: ShutdownSignal,
    processes: ProcessRegistry,
) -> JoinHandle<TaskOutcome> {
    tokio::spawn(async move {
        let _guard = guard;
        debug!("task unit started");

        let outcome = tokio::select! {
            result = dispatcher.fetch_and_execute_tasks(&shutdown, &processes) => match result {
                Ok(()) => TaskOutcome::Completed,
                Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
                Err(e) => {
                    error!(error = %e, "task unit failed");
                    TaskOutcome::Failed(e.to_string())
                }
            },
            _ = shutdown.cancelled() => TaskOutcome::Cancelled,
        };

        if outcome == TaskOutcome::Cancelled {
            info!("task unit cancelled by shutdown");
        }
        outcome
    })
}
