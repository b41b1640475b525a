use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

/// Process-level side effects of applying an update.
///
/// Production uses [`SystemProcessControl`]; tests substitute a recorder so an
/// update can run to completion without replacing the test process.
pub trait ProcessControl: Send + Sync {
    /// Start `executable` with `args` as an independent process.
    fn relaunch(&self, executable: &Path, args: &[String]) -> io::Result<()>;

    /// Start the replacement helper script detached from this process.
    fn spawn_helper(&self, script: &Path) -> io::Result<()>;

    /// Terminate the current process. The system implementation never returns.
    fn exit(&self, code: i32);
}

/// Spawns real processes and exits for real.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn relaunch(&self, executable: &Path, args: &[String]) -> io::Result<()> {
        let child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        info!(pid = child.id(), path = %executable.display(), "relaunched executable");
        Ok(())
    }

    fn spawn_helper(&self, script: &Path) -> io::Result<()> {
        let child = helper_command(script).spawn()?;
        info!(pid = child.id(), script = %script.display(), "update helper started");
        Ok(())
    }

    fn exit(&self, code: i32) {
        info!(code, "exiting for update");
        std::process::exit(code);
    }
}

#[cfg(windows)]
fn helper_command(script: &Path) -> Command {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    let mut cmd = Command::new("cmd");
    cmd.arg("/C")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    cmd
}

#[cfg(not(windows))]
fn helper_command(script: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}
