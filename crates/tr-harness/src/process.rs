use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const KILL_WAIT: Duration = Duration::from_secs(5);

/// Child processes spawned on behalf of task execution.
///
/// Task handlers spawn through the registry so the agent can terminate any
/// survivors when it shuts down.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    children: Arc<Mutex<HashMap<u32, Child>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` and track the resulting child. Returns its pid.
    pub async fn spawn(&self, command: &mut Command) -> io::Result<u32> {
        let child = command.kill_on_drop(true).spawn()?;
        self.track(child).await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "child exited before a pid was assigned")
        })
    }

    /// Track an already spawned child. Returns `None` if it has no pid.
    async fn track(&self, child: Child) -> Option<u32> {
        let pid = child.id()?;
        self.children.lock().await.insert(pid, child);
        debug!(pid, "tracking child process");
        Some(pid)
    }

    /// Poll one tracked child. Once it has exited its status is returned and
    /// it is no longer tracked; `Ok(None)` while it is still running.
    pub async fn try_status(&self, pid: u32) -> io::Result<Option<ExitStatus>> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&pid) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("pid {pid} is not tracked"),
            ));
        };
        let status = child.try_wait()?;
        if status.is_some() {
            children.remove(&pid);
        }
        Ok(status)
    }

    /// Drop children that have already exited. Returns how many were removed.
    pub async fn reap_exited(&self) -> usize {
        let mut children = self.children.lock().await;
        let before = children.len();
        children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "child process exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid, error = %e, "failed to poll child process");
                false
            }
        });
        before - children.len()
    }

    /// Kill every tracked child and wait briefly for each to exit.
    ///
    /// Returns the number of children that were signalled.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(u32, Child)> = self.children.lock().await.drain().collect();
        let mut killed = 0;

        for (pid, mut child) in drained {
            if let Ok(Some(_)) = child.try_wait() {
                continue;
            }
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "failed to kill child process");
                continue;
            }
            killed += 1;
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(pid, %status, "child process terminated"),
                Ok(Err(e)) => warn!(pid, error = %e, "failed to wait for child process"),
                Err(_) => warn!(pid, "child process did not exit after kill"),
            }
        }

        if killed > 0 {
            info!(count = killed, "terminated child processes");
        }
        killed
    }
}
