use tr_core::release::{Asset, Release};

/// Operating systems that receive published binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    /// The platform this binary was compiled for, if releases exist for it.
    pub fn current() -> Option<Self> {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Option<Self> {
        match os {
            "windows" => Some(Platform::Windows),
            "linux" => Some(Platform::Linux),
            "macos" => Some(Platform::MacOs),
            _ => None,
        }
    }

    /// Label used in asset names.
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            Platform::Linux | Platform::MacOs => "",
        }
    }

    /// Whether the OS refuses to overwrite the file of a running executable.
    pub fn locks_running_executable(&self) -> bool {
        matches!(self, Platform::Windows)
    }
}

/// Architecture label of the running process, as used in asset names.
pub fn current_arch() -> String {
    arch_label(std::env::consts::ARCH)
}

/// Map a Rust target architecture onto the published naming (`x64`, `arm64`, ...).
pub fn arch_label(rust_arch: &str) -> String {
    match rust_arch {
        "x86_64" => "x64".to_string(),
        "aarch64" => "arm64".to_string(),
        "x86" | "i586" | "i686" => "x86".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// `<platform>-<version without v>-<arch>[.exe]`
pub fn expected_asset_name(platform: Platform, version_label: &str, arch: &str) -> String {
    format!(
        "{}-{}-{}{}",
        platform.label(),
        version_label,
        arch.to_ascii_lowercase(),
        platform.executable_suffix()
    )
}

/// Pick the binary asset whose name equals or contains `expected`,
/// ignoring case. Checksum siblings are never returned.
pub fn find_matching_asset<'a>(release: &'a Release, expected: &str) -> Option<&'a Asset> {
    let expected = expected.to_ascii_lowercase();
    release
        .assets
        .iter()
        .filter(|a| !a.name.to_ascii_lowercase().ends_with(".sha256"))
        .find(|a| {
            let name = a.name.to_ascii_lowercase();
            name == expected || name.contains(&expected)
        })
}
