use std::fmt;
use std::path::{Component, Path, PathBuf};

use tr_core::config::UpdatesConfig;

/// Why a detected update is not applied in this environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Running under a debugger or from a development checkout.
    Development(String),
    /// Running inside a container, whose image should be rebuilt instead.
    Container(String),
    /// No published binaries exist for this OS.
    UnsupportedPlatform(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Development(why) => write!(f, "development environment ({why})"),
            SkipReason::Container(why) => write!(f, "container environment ({why})"),
            SkipReason::UnsupportedPlatform(os) => write!(f, "unsupported platform ({os})"),
        }
    }
}

/// Markers that disqualify the running instance from self-updating.
#[derive(Debug, Clone)]
pub struct DeploymentProbe {
    pub dev_marker_var: String,
    pub container_marker_var: String,
    pub container_marker_file: PathBuf,
    /// Read on Linux only; `None` disables the cgroup check.
    pub cgroup_file: Option<PathBuf>,
    pub check_debugger: bool,
}

impl DeploymentProbe {
    pub fn from_config(updates: &UpdatesConfig) -> Self {
        Self {
            dev_marker_var: updates.dev_marker_var.clone(),
            container_marker_var: updates.container_marker_var.clone(),
            container_marker_file: PathBuf::from(&updates.container_marker_file),
            cgroup_file: cfg!(target_os = "linux").then(|| PathBuf::from("/proc/1/cgroup")),
            check_debugger: true,
        }
    }

    /// First reason to skip, development checks before container checks.
    pub fn detect(&self, executable: Option<&Path>) -> Option<SkipReason> {
        self.development_reason(executable)
            .map(SkipReason::Development)
            .or_else(|| self.container_reason().map(SkipReason::Container))
    }

    fn development_reason(&self, executable: Option<&Path>) -> Option<String> {
        if self.check_debugger && debugger_attached() {
            return Some("debugger attached".to_string());
        }
        if env_flag_set(&self.dev_marker_var) {
            return Some(format!("{} is set", self.dev_marker_var));
        }
        match executable {
            Some(path) if is_development_build_path(path) => {
                Some(format!("running from build directory {}", path.display()))
            }
            _ => None,
        }
    }

    fn container_reason(&self) -> Option<String> {
        if self.container_marker_file.exists() {
            return Some(format!("{} exists", self.container_marker_file.display()));
        }
        if env_flag_set(&self.container_marker_var) {
            return Some(format!("{} is set", self.container_marker_var));
        }
        let cgroup = self.cgroup_file.as_ref()?;
        let contents = std::fs::read_to_string(cgroup).ok()?;
        cgroup_indicates_container(&contents)
            .then(|| format!("{} names a container runtime", cgroup.display()))
    }
}

fn env_flag_set(name: &str) -> bool {
    !name.is_empty()
        && std::env::var_os(name)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
}

/// True when a tracer is attached to this process (Linux `TracerPid`).
pub fn debugger_attached() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| tracer_pid_nonzero(&status))
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn tracer_pid_nonzero(status: &str) -> bool {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .map(|pid| pid.trim() != "0")
        .unwrap_or(false)
}

/// Whether `path` lives under a cargo `target/debug` directory.
pub fn is_development_build_path(path: &Path) -> bool {
    let names: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_ascii_lowercase()),
            _ => None,
        })
        .collect();
    names
        .windows(2)
        .any(|pair| pair[0] == "target" && pair[1] == "debug")
}

/// Whether cgroup contents point at a container or orchestrator runtime.
pub fn cgroup_indicates_container(contents: &str) -> bool {
    const MARKERS: [&str; 6] = ["docker", "kubepods", "containerd", "lxc", "podman", "libpod"];
    let lower = contents.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}
