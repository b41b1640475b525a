use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tr_core::config::Config;
use tr_core::schedule::PeriodicGate;
use tr_harness::process::ProcessRegistry;
use tr_harness::shutdown::ShutdownSignal;

/// Shared "a task unit is running" flag.
///
/// Set by [`TaskRunFlag::try_acquire`] before a unit is launched and cleared
/// when the returned guard is dropped, which the unit does on every exit path
/// including panics.
#[derive(Debug, Clone, Default)]
pub struct TaskRunFlag {
    running: Arc<AtomicBool>,
}

impl TaskRunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the flag. `None` while another unit holds it.
    pub fn try_acquire(&self) -> Option<TaskRunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TaskRunGuard {
                running: Arc::clone(&self.running),
            })
    }
}

/// Holds the task flag; clears it on drop.
#[derive(Debug)]
pub struct TaskRunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for TaskRunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Gates for the dispatcher-facing periodic actions.
#[derive(Debug, Clone)]
pub struct LoopGates {
    pub registration: PeriodicGate,
    pub heartbeat: PeriodicGate,
}

/// Everything the agent loop owns for the life of the process.
///
/// Built once at startup and handed to the daemon; tests build a fresh one
/// per case.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: Config,
    pub shutdown: ShutdownSignal,
    pub processes: ProcessRegistry,
    pub task_flag: TaskRunFlag,
    pub gates: LoopGates,
}

impl AgentContext {
    pub fn new(config: Config) -> Self {
        let gates = LoopGates {
            registration: PeriodicGate::new("re-registration", config.intervals.registration()),
            heartbeat: PeriodicGate::new("heartbeat", config.intervals.heartbeat()),
        };
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            processes: ProcessRegistry::new(),
            task_flag: TaskRunFlag::new(),
            gates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_single_flight() {
        let flag = TaskRunFlag::new();
        let guard = flag.try_acquire().expect("first acquire");
        assert!(flag.is_running());
        assert!(flag.try_acquire().is_none());

        drop(guard);
        assert!(!flag.is_running());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn flag_clears_on_panic() {
        let flag = TaskRunFlag::new();
        let clone = flag.clone();
        let result = std::thread::spawn(move || {
            let _guard = clone.try_acquire().expect("acquire");
            panic!("task blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!flag.is_running());
    }

    #[test]
    fn context_gates_follow_config() {
        let mut config = Config::default();
        config.intervals.heartbeat_secs = 5;
        config.intervals.registration_secs = 50;
        let ctx = AgentContext::new(config);
        assert_eq!(ctx.gates.heartbeat.interval().as_secs(), 5);
        assert_eq!(ctx.gates.registration.interval().as_secs(), 50);
        assert!(!ctx.task_flag.is_running());
        assert!(!ctx.shutdown.is_shutting_down());
    }
}
