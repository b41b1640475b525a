use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::platform::Platform;
use crate::relaunch::ProcessControl;

/// Seconds the helper script waits for the old process to go away.
const HELPER_WAIT_SECS: u32 = 30;

/// Inputs to one executable replacement.
#[derive(Debug, Clone, Copy)]
pub struct SwapRequest<'a> {
    /// Verified new binary (a temporary file, possibly on another filesystem).
    pub payload: &'a Path,
    /// The running executable.
    pub live: &'a Path,
    /// Copy of the live executable taken before the swap.
    pub backup: &'a Path,
    /// Original command-line arguments, without `argv[0]`.
    pub args: &'a [String],
}

/// What the caller still has to do after a successful swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The live path now holds the new binary; relaunch it, then exit.
    Replaced,
    /// A helper will replace and relaunch once this process exits; exit now.
    HandedOff,
}

/// A way of putting a new binary at the live executable's path.
///
/// Implementations must never leave a truncated file at the live path: an
/// observer sees either the complete old binary or the complete new one.
pub trait SwapStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, request: &SwapRequest<'_>) -> Result<SwapOutcome, UpdateError>;
}

/// Pick the strategy for `platform`.
pub fn strategy_for(platform: Platform, process: Arc<dyn ProcessControl>) -> Arc<dyn SwapStrategy> {
    if platform.locks_running_executable() {
        Arc::new(LockedFileSwap::new(process, std::process::id()))
    } else {
        Arc::new(InPlaceSwap)
    }
}

// ---------------------------------------------------------------------------
// In-place rename
// ---------------------------------------------------------------------------

/// Rename over the running executable. Unix keeps the old inode alive for the
/// running process image, so the rename is safe and atomic.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceSwap;

impl SwapStrategy for InPlaceSwap {
    fn name(&self) -> &'static str {
        "in-place"
    }

    fn apply(&self, request: &SwapRequest<'_>) -> Result<SwapOutcome, UpdateError> {
        let staged = sibling_with_suffix(request.live, ".new");
        stage_payload(request.payload, &staged)?;

        if let Err(source) = fs::rename(&staged, request.live) {
            let _ = fs::remove_file(&staged);
            return Err(UpdateError::Swap {
                path: request.live.to_path_buf(),
                source,
            });
        }

        info!(path = %request.live.display(), "executable replaced in place");
        Ok(SwapOutcome::Replaced)
    }
}

// ---------------------------------------------------------------------------
// Locked-file helper
// ---------------------------------------------------------------------------

/// Hand the replacement to a detached helper script, for systems that lock the
/// file of a running executable.
pub struct LockedFileSwap {
    process: Arc<dyn ProcessControl>,
    wait_pid: u32,
}

impl LockedFileSwap {
    /// `wait_pid` is the process the helper waits on before touching the live
    /// file; normally the running agent.
    pub fn new(process: Arc<dyn ProcessControl>, wait_pid: u32) -> Self {
        Self { process, wait_pid }
    }
}

impl SwapStrategy for LockedFileSwap {
    fn name(&self) -> &'static str {
        "locked-file"
    }

    fn apply(&self, request: &SwapRequest<'_>) -> Result<SwapOutcome, UpdateError> {
        let staged = sibling_with_suffix(request.live, ".update");
        stage_payload(request.payload, &staged)?;

        let script = HelperScript {
            wait_pid: self.wait_pid,
            staged: staged.clone(),
            live: request.live.to_path_buf(),
            backup: request.backup.to_path_buf(),
            args: request.args.to_vec(),
        };
        let script_path = helper_script_path(request.live, self.wait_pid);

        let launched = fs::write(&script_path, script.render())
            .and_then(|_| make_executable(&script_path))
            .and_then(|_| self.process.spawn_helper(&script_path));
        if let Err(source) = launched {
            let _ = fs::remove_file(&staged);
            let _ = fs::remove_file(&script_path);
            return Err(UpdateError::Swap {
                path: script_path,
                source,
            });
        }

        info!(
            script = %script_path.display(),
            staged = %staged.display(),
            "replacement handed to helper script"
        );
        Ok(SwapOutcome::HandedOff)
    }
}

fn helper_script_path(live: &Path, pid: u32) -> PathBuf {
    let dir = live.parent().unwrap_or_else(|| Path::new("."));
    let ext = if cfg!(windows) { "cmd" } else { "sh" };
    dir.join(format!("hasheous-taskrunner-update-{pid}.{ext}"))
}

/// The helper that finishes a handed-off replacement.
#[derive(Debug, Clone)]
pub struct HelperScript {
    pub wait_pid: u32,
    pub staged: PathBuf,
    pub live: PathBuf,
    pub backup: PathBuf,
    pub args: Vec<String>,
}

impl HelperScript {
    /// Script in the host's native shell.
    pub fn render(&self) -> String {
        if cfg!(windows) {
            self.render_batch()
        } else {
            self.render_shell()
        }
    }

    pub fn render_batch(&self) -> String {
        let args: Vec<String> = self.args.iter().map(|a| batch_quote(a)).collect();
        let staged = batch_quote(&self.staged.to_string_lossy());
        let live = batch_quote(&self.live.to_string_lossy());
        let backup = batch_quote(&self.backup.to_string_lossy());
        format!(
            "@echo off\r\n\
             setlocal\r\n\
             set TRIES=0\r\n\
             :wait\r\n\
             tasklist /FI \"PID eq {pid}\" 2>NUL | find \"{pid}\" >NUL\r\n\
             if errorlevel 1 goto replace\r\n\
             set /a TRIES+=1\r\n\
             if %TRIES% GEQ {wait} goto replace\r\n\
             timeout /t 1 /nobreak >NUL\r\n\
             goto wait\r\n\
             :replace\r\n\
             move /Y {staged} {live} >NUL\r\n\
             if errorlevel 1 goto restore\r\n\
             start \"\" {live} {args}\r\n\
             del /F /Q {backup} >NUL 2>&1\r\n\
             (goto) 2>NUL & del \"%~f0\"\r\n\
             :restore\r\n\
             move /Y {backup} {live} >NUL\r\n\
             echo hasheous-taskrunner update failed; previous version restored 1>&2\r\n\
             exit /b 1\r\n",
            pid = self.wait_pid,
            wait = HELPER_WAIT_SECS,
            args = args.join(" "),
        )
    }

    pub fn render_shell(&self) -> String {
        let args: Vec<String> = self.args.iter().map(|a| shell_quote(a)).collect();
        let staged = shell_quote(&self.staged.to_string_lossy());
        let live = shell_quote(&self.live.to_string_lossy());
        let backup = shell_quote(&self.backup.to_string_lossy());
        format!(
            "#!/bin/sh\n\
             tries=0\n\
             while kill -0 {pid} 2>/dev/null && [ \"$tries\" -lt {wait} ]; do\n\
             \x20 sleep 1\n\
             \x20 tries=$((tries + 1))\n\
             done\n\
             if mv -f {staged} {live}; then\n\
             \x20 chmod +x {live} 2>/dev/null\n\
             \x20 {live} {args} >/dev/null 2>&1 &\n\
             \x20 rm -f {backup}\n\
             \x20 rm -f \"$0\"\n\
             \x20 exit 0\n\
             fi\n\
             mv -f {backup} {live}\n\
             echo 'hasheous-taskrunner update failed; previous version restored' >&2\n\
             exit 1\n",
            pid = self.wait_pid,
            wait = HELPER_WAIT_SECS,
            args = args.join(" "),
        )
    }
}

fn batch_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('%', "%%").replace('"', "\"\""))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Copy of the live executable kept for the duration of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub backup_path: PathBuf,
    pub original_path: PathBuf,
}

impl BackupRecord {
    /// Copy `live` to `<live>.backup`, replacing a stale backup if present.
    pub fn create(live: &Path) -> io::Result<Self> {
        let backup_path = sibling_with_suffix(live, ".backup");
        if backup_path.exists() {
            debug!(path = %backup_path.display(), "replacing stale backup");
            fs::remove_file(&backup_path)?;
        }
        fs::copy(live, &backup_path)?;
        info!(backup = %backup_path.display(), "backup created");
        Ok(Self {
            backup_path,
            original_path: live.to_path_buf(),
        })
    }

    /// Put the backup back at the original path.
    ///
    /// A live file that is byte-identical to the backup was never touched and
    /// is left alone; otherwise it is removed and the backup moved into place.
    pub fn restore(&self) -> io::Result<()> {
        if self.live_matches_backup() {
            fs::remove_file(&self.backup_path)?;
            return Ok(());
        }

        match fs::remove_file(&self.original_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if fs::rename(&self.backup_path, &self.original_path).is_err() {
            fs::copy(&self.backup_path, &self.original_path)?;
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    /// Delete the backup once it is no longer needed.
    pub fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.backup_path) {
            warn!(path = %self.backup_path.display(), error = %e, "failed to remove backup");
        }
    }

    fn live_matches_backup(&self) -> bool {
        match (fs::read(&self.original_path), fs::read(&self.backup_path)) {
            (Ok(live), Ok(backup)) => live == backup,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<path><suffix>` in the same directory, so renames stay on one filesystem.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy `payload` to `staged`, flushed to disk and executable.
fn stage_payload(payload: &Path, staged: &Path) -> Result<(), UpdateError> {
    let result = (|| -> io::Result<()> {
        if staged.exists() {
            fs::remove_file(staged)?;
        }
        fs::copy(payload, staged)?;
        File::open(staged)?.sync_all()?;
        make_executable(staged)
    })();

    result.map_err(|source| {
        let _ = fs::remove_file(staged);
        UpdateError::Swap {
            path: staged.to_path_buf(),
            source,
        }
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
