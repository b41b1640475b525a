use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tr_harness::retry::{retry_with_backoff, RetryError, RetryPolicy};
use tr_harness::shutdown::ShutdownSignal;
use tr_updater::UpdateExecutor;

use crate::context::AgentContext;
use crate::dispatcher::Dispatcher;
use crate::task_unit::{self, TaskOutcome};

/// How long shutdown waits for a running task unit before aborting it.
pub const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one gated step within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepStatus {
    /// The gate was closed (or the step is disabled).
    #[default]
    NotDue,
    Ran,
    Failed,
    /// A task unit was already running, so none was launched.
    Busy,
}

/// What each step of a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub registration: StepStatus,
    pub heartbeat: StepStatus,
    pub update: StepStatus,
    pub task: StepStatus,
}

/// The agent loop.
///
/// Registers at startup, then ticks until the shutdown signal fires. Every
/// tick runs re-registration, heartbeat, update check and task launch in that
/// order; each step is isolated so a failure (or panic) in one never stops
/// the others or the loop.
pub struct Daemon {
    ctx: AgentContext,
    dispatcher: Arc<dyn Dispatcher>,
    updater: Option<UpdateExecutor>,
    task: Option<JoinHandle<TaskOutcome>>,
    startup_retry: RetryPolicy,
    unregister_retry: RetryPolicy,
}

impl Daemon {
    /// `updater` is `None` when self-update is disabled.
    pub fn new(
        ctx: AgentContext,
        dispatcher: Arc<dyn Dispatcher>,
        updater: Option<UpdateExecutor>,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            updater,
            task: None,
            startup_retry: RetryPolicy::default(),
            unregister_retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(500),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn set_startup_retry(&mut self, policy: RetryPolicy) {
        self.startup_retry = policy;
    }

    pub fn set_unregister_retry(&mut self, policy: RetryPolicy) {
        self.unregister_retry = policy;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Register, run the startup update check, then tick until shutdown.
    ///
    /// Fails only when startup registration fails; the loop is not entered.
    pub async fn run(mut self) -> Result<()> {
        if !self.register_at_startup().await? {
            info!("shutdown requested during startup");
            return Ok(());
        }

        if let Some(updater) = &self.updater {
            let outcome = updater.check_at_startup(Instant::now()).await;
            debug!(outcome = ?outcome, "startup update check finished");
        }

        let tick = self.ctx.config.intervals.tick();
        info!(tick_secs = tick.as_secs(), "agent loop started");

        loop {
            if self.ctx.shutdown.is_shutting_down() {
                break;
            }

            let report = self.tick(Instant::now()).await;
            debug!(report = ?report, "tick finished");

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.ctx.shutdown.cancelled() => {
                    info!("shutdown signal received, stopping agent loop");
                    break;
                }
            }
        }

        self.shutdown_cleanup().await;
        Ok(())
    }

    /// Returns `false` if shutdown interrupted the attempt.
    async fn register_at_startup(&mut self) -> Result<bool> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let result = retry_with_backoff(
            &self.startup_retry,
            "register",
            Some(&self.ctx.shutdown),
            |_| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.register().await }
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.ctx.gates.registration.mark_run(Instant::now());
                Ok(true)
            }
            Err(RetryError::Cancelled { .. }) => Ok(false),
            Err(e) => {
                error!(error = %e, "startup registration failed");
                Err(anyhow!(e).context("cannot start without registering with the dispatcher"))
            }
        }
    }

    /// Run one tick at `now`.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        if self.ctx.gates.registration.try_begin(now) {
            let dispatcher = Arc::clone(&self.dispatcher);
            report.registration =
                isolated("re-registration", async move { dispatcher.re_register().await }).await;
        }

        if self.ctx.gates.heartbeat.try_begin(now) {
            let dispatcher = Arc::clone(&self.dispatcher);
            report.heartbeat =
                isolated("heartbeat", async move { dispatcher.send_heartbeat().await }).await;
        }

        if let Some(updater) = &self.updater {
            report.update = match AssertUnwindSafe(updater.check_if_due(now))
                .catch_unwind()
                .await
            {
                Ok(None) => StepStatus::NotDue,
                Ok(Some(outcome)) if outcome.is_failure() => StepStatus::Failed,
                Ok(Some(_)) => StepStatus::Ran,
                Err(_) => {
                    error!(step = "update-check", "step panicked");
                    StepStatus::Failed
                }
            };
        }

        report.task = self.launch_task_if_idle().await;
        report
    }

    async fn launch_task_if_idle(&mut self) -> StepStatus {
        let Some(guard) = self.ctx.task_flag.try_acquire() else {
            return StepStatus::Busy;
        };
        // Only reap once no unit is polling its own children.
        self.ctx.processes.reap_exited().await;
        // The previous unit released the flag, so its handle is about to finish.
        if let Some(previous) = self.task.take() {
            log_task_result(previous.await);
        }

        self.task = Some(task_unit::launch(
            Arc::clone(&self.dispatcher),
            guard,
            self.ctx.shutdown.clone(),
            self.ctx.processes.clone(),
        ));
        StepStatus::Ran
    }

    /// Stop children, let the task unit wind down, then unregister.
    async fn shutdown_cleanup(&mut self) {
        let killed = self.ctx.processes.kill_all().await;
        debug!(killed, "child processes cleaned up");

        if let Some(mut handle) = self.task.take() {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, &mut handle).await {
                Ok(result) => log_task_result(result),
                Err(_) => {
                    warn!("task unit did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let result = retry_with_backoff(&self.unregister_retry, "unregister", None, |_| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.unregister().await }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "unregistration failed");
        }
        info!("agent stopped");
    }
}

/// Run one step, turning errors and panics into a logged [`StepStatus::Failed`].
async fn isolated<F, E>(step: &'static str, fut: F) -> StepStatus
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => StepStatus::Ran,
        Ok(Err(e)) => {
            error!(step, error = %e, "step failed");
            StepStatus::Failed
        }
        Err(_) => {
            error!(step, "step panicked");
            StepStatus::Failed
        }
    }
}

fn log_task_result(result: std::result::Result<TaskOutcome, tokio::task::JoinError>) {
    match result {
        Ok(TaskOutcome::Completed) => debug!("task unit completed"),
        Ok(TaskOutcome::Cancelled) => debug!("task unit cancelled"),
        Ok(TaskOutcome::Failed(e)) => debug!(error = %e, "task unit had failed"),
        Err(e) if e.is_panic() => error!(error = %e, "task unit panicked"),
        Err(e) => warn!(error = %e, "task unit did not finish"),
    }
}

/// Best-effort unregistration for the last-resort failure path.
pub async fn emergency_unregister(dispatcher: &dyn Dispatcher) {
    if !dispatcher.is_registered() {
        return;
    }
    warn!("attempting emergency unregistration");
    match dispatcher.unregister().await {
        Ok(()) => info!("emergency unregistration succeeded"),
        Err(e) => error!(error = %e, "emergency unregistration failed"),
    }
}
