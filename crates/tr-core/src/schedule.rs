use std::time::{Duration, Instant};

/// Gate for a periodic action: fires when at least `interval` has elapsed
/// since the last run.
///
/// A gate that has never run is always due. Callers stamp the gate with
/// [`PeriodicGate::mark_run`] immediately *before* starting the attempt, so a
/// slow or failing attempt does not cause a retry on the very next tick.
#[derive(Debug, Clone)]
pub struct PeriodicGate {
    name: &'static str,
    interval: Duration,
    last_run: Option<Instant>,
}

impl PeriodicGate {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            last_run: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark_run(&mut self, now: Instant) {
        self.last_run = Some(now);
    }

    /// Check and stamp in one step. Returns whether the action should run.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.mark_run(now);
            true
        } else {
            false
        }
    }
}
