use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tr_core::config::UpdatesConfig;
use tr_core::schedule::PeriodicGate;
use tr_core::version::Version;
use tr_harness::retry::{retry_with_backoff, RetryPolicy};
use tracing::{error, info, warn};

use crate::download::{download_to_temp, fetch_checksum, ChecksumLookup, DownloadedAsset};
use crate::environment::{DeploymentProbe, SkipReason};
use crate::error::UpdateError;
use crate::locator::ReleaseLocator;
use crate::platform::{self, Platform};
use crate::relaunch::{ProcessControl, SystemProcessControl};
use crate::swap::{self, BackupRecord, SwapOutcome, SwapRequest, SwapStrategy};

/// Fixed period between scheduled update checks.
pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Gate for the daily check plus the wall-clock time of the last attempt.
#[derive(Debug, Clone)]
pub struct UpdateCheckState {
    gate: PeriodicGate,
    last_checked_at: Option<DateTime<Utc>>,
}

impl UpdateCheckState {
    pub fn new(interval: Duration) -> Self {
        Self {
            gate: PeriodicGate::new("update-check", interval),
            last_checked_at: None,
        }
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at
    }

    fn stamp(&mut self, now: Instant) {
        self.gate.mark_run(now);
        self.last_checked_at = Some(Utc::now());
    }
}

impl Default for UpdateCheckState {
    fn default() -> Self {
        Self::new(UPDATE_CHECK_INTERVAL)
    }
}

/// How one update attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another attempt was still running.
    AlreadyInProgress,
    /// The feed had no stable release or could not be read.
    NoRelease,
    UpToDate { current: Version, latest: Version },
    Skipped { latest: Version, reason: SkipReason },
    NoMatchingAsset { expected: String },
    DownloadFailed(String),
    ChecksumMismatch { expected: String, actual: String },
    /// Failed before the live executable was touched.
    Failed(String),
    /// Failed after the backup was taken; the backup was restored.
    RolledBack { error: String },
    /// Failed and the backup could not be restored; it is left at `backup`.
    RollbackFailed { error: String, backup: PathBuf },
    /// The new binary is in place (or handed to the helper) and the process
    /// has been asked to exit.
    Applied { version: Version },
}

impl UpdateOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::DownloadFailed(_)
                | UpdateOutcome::ChecksumMismatch { .. }
                | UpdateOutcome::Failed(_)
                | UpdateOutcome::RolledBack { .. }
                | UpdateOutcome::RollbackFailed { .. }
        )
    }
}

/// Drives update attempts: discovery, verification, swap, relaunch.
pub struct UpdateExecutor {
    locator: ReleaseLocator,
    client: reqwest::Client,
    current_version: Version,
    platform: Option<Platform>,
    arch: String,
    probe: DeploymentProbe,
    strategy: Option<Arc<dyn SwapStrategy>>,
    process: Arc<dyn ProcessControl>,
    executable: Option<PathBuf>,
    args: Vec<String>,
    temp_dir: Option<PathBuf>,
    download_retry: RetryPolicy,
    in_progress: AtomicBool,
    state: Mutex<UpdateCheckState>,
}

/// Builder for [`UpdateExecutor`]; every collaborator defaults to the real
/// system one.
pub struct UpdateExecutorBuilder {
    feed_url: String,
    user_agent: String,
    timeout: Duration,
    current_version: Version,
    platform: Option<Platform>,
    arch: String,
    probe: DeploymentProbe,
    strategy: Option<Arc<dyn SwapStrategy>>,
    process: Arc<dyn ProcessControl>,
    executable: Option<PathBuf>,
    args: Vec<String>,
    temp_dir: Option<PathBuf>,
    download_retry: RetryPolicy,
    check_interval: Duration,
}

impl UpdateExecutorBuilder {
    pub fn platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn probe(mut self, probe: DeploymentProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Force a swap strategy instead of picking one per platform.
    pub fn strategy(mut self, strategy: Arc<dyn SwapStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn process_control(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Treat `path` as the running executable.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Arguments passed to the relaunched process.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn download_retry(mut self, policy: RetryPolicy) -> Self {
        self.download_retry = policy;
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn build(self) -> Result<UpdateExecutor, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .build()?;
        let locator = ReleaseLocator::with_client(client.clone(), self.feed_url);

        Ok(UpdateExecutor {
            locator,
            client,
            current_version: self.current_version,
            platform: self.platform,
            arch: self.arch,
            probe: self.probe,
            strategy: self.strategy,
            process: self.process,
            executable: self.executable,
            args: self.args,
            temp_dir: self.temp_dir,
            download_retry: self.download_retry,
            in_progress: AtomicBool::new(false),
            state: Mutex::new(UpdateCheckState::new(self.check_interval)),
        })
    }
}

/// Clears the in-progress flag however the attempt ends.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UpdateExecutor {
    pub fn builder(config: &UpdatesConfig, current_version: Version) -> UpdateExecutorBuilder {
        UpdateExecutorBuilder {
            feed_url: config.feed_url.clone(),
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout(),
            current_version,
            platform: Platform::current(),
            arch: platform::current_arch(),
            probe: DeploymentProbe::from_config(config),
            strategy: None,
            process: Arc::new(SystemProcessControl),
            executable: None,
            args: std::env::args().skip(1).collect(),
            temp_dir: None,
            download_retry: RetryPolicy::default(),
            check_interval: UPDATE_CHECK_INTERVAL,
        }
    }

    pub fn current_version(&self) -> Version {
        self.current_version
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_checked_at()
    }

    /// Run a check if the daily gate is open. `None` when not yet due.
    pub async fn check_if_due(&self, now: Instant) -> Option<UpdateOutcome> {
        {
            let mut state = self.lock_state();
            if !state.gate.is_due(now) {
                return None;
            }
            state.stamp(now);
        }
        Some(self.check_and_apply_update().await)
    }

    /// The unconditional check at startup. It still stamps the gate, so the
    /// next scheduled check is a full interval away.
    pub async fn check_at_startup(&self, now: Instant) -> UpdateOutcome {
        self.lock_state().stamp(now);
        self.check_and_apply_update().await
    }

    /// One full update attempt. Never fails outward: every problem is logged
    /// and reported as an [`UpdateOutcome`].
    pub async fn check_and_apply_update(&self) -> UpdateOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("update check already in progress, skipping");
            return UpdateOutcome::AlreadyInProgress;
        }
        let _guard = InProgressGuard(&self.in_progress);

        let outcome = self.attempt().await;
        if outcome.is_failure() {
            warn!(outcome = ?outcome, "update attempt failed");
        }
        outcome
    }

    async fn attempt(&self) -> UpdateOutcome {
        let Some(latest) = self.locator.find_latest_stable_release().await else {
            return UpdateOutcome::NoRelease;
        };

        let latest_version = latest.version();
        if latest_version <= self.current_version {
            info!(current = %self.current_version, latest = %latest_version, "already up to date");
            return UpdateOutcome::UpToDate {
                current: self.current_version,
                latest: latest_version,
            };
        }
        info!(current = %self.current_version, latest = %latest_version, "update available");

        let Some(platform) = self.platform else {
            let reason = SkipReason::UnsupportedPlatform(std::env::consts::OS.to_string());
            info!(%reason, "skipping update");
            return UpdateOutcome::Skipped {
                latest: latest_version,
                reason,
            };
        };

        let executable = self.resolve_executable();
        if let Some(reason) = self.probe.detect(executable.as_ref().ok().map(PathBuf::as_path)) {
            info!(%reason, "skipping update");
            return UpdateOutcome::Skipped {
                latest: latest_version,
                reason,
            };
        }

        let expected = platform::expected_asset_name(platform, latest.version_label(), &self.arch);
        let Some(asset) = platform::find_matching_asset(&latest, &expected) else {
            warn!(tag = %latest.tag, expected = %expected, "release has no asset for this platform");
            return UpdateOutcome::NoMatchingAsset { expected };
        };

        let checksum = fetch_checksum(&self.client, &latest, asset).await;
        match &checksum {
            ChecksumLookup::Found(_) => {}
            ChecksumLookup::Missing => warn!(
                asset = %asset.name,
                "no checksum published for update; installing WITHOUT integrity verification"
            ),
            ChecksumLookup::FetchFailed(e) => warn!(
                asset = %asset.name,
                error = %e,
                "checksum could not be fetched; installing WITHOUT integrity verification"
            ),
        }

        let client = &self.client;
        let url = asset.download_url.as_str();
        let temp_dir = self.temp_dir.as_deref();
        let payload = match retry_with_backoff(&self.download_retry, "download update", None, move |_| {
            download_to_temp(client, url, temp_dir)
        })
        .await
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(url, error = %e, "update download failed");
                return UpdateOutcome::DownloadFailed(e.to_string());
            }
        };
        info!(bytes = payload.len(), sha256 = %payload.sha256(), "update downloaded");

        if let Some(expected) = checksum.digest() {
            if !payload.matches_digest(expected) {
                let actual = payload.sha256().to_string();
                error!(expected, actual = %actual, "update checksum mismatch, discarding download");
                payload.discard();
                return UpdateOutcome::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                };
            }
            info!("update checksum verified");
        }

        let executable = match executable {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "cannot apply update");
                payload.discard();
                return UpdateOutcome::Failed(e.to_string());
            }
        };

        let backup = match BackupRecord::create(&executable) {
            Ok(backup) => backup,
            Err(e) => {
                error!(path = %executable.display(), error = %e, "failed to back up executable");
                payload.discard();
                return UpdateOutcome::Failed(e.to_string());
            }
        };

        self.install(payload, &executable, backup, latest_version)
    }

    fn install(
        &self,
        payload: DownloadedAsset,
        executable: &Path,
        backup: BackupRecord,
        version: Version,
    ) -> UpdateOutcome {
        let strategy = self.strategy();
        info!(strategy = strategy.name(), path = %executable.display(), "applying update");

        let request = SwapRequest {
            payload: payload.path(),
            live: executable,
            backup: &backup.backup_path,
            args: &self.args,
        };
        let swapped = strategy.apply(&request).and_then(|outcome| match outcome {
            SwapOutcome::Replaced => self
                .process
                .relaunch(executable, &self.args)
                .map(|()| outcome)
                .map_err(|source| UpdateError::Relaunch {
                    path: executable.to_path_buf(),
                    source,
                }),
            SwapOutcome::HandedOff => Ok(outcome),
        });

        payload.discard();
        match swapped {
            Ok(outcome) => {
                // The helper script still needs the backup.
                if outcome == SwapOutcome::Replaced {
                    backup.discard();
                }
                info!(%version, "update applied, exiting");
                self.process.exit(0);
                UpdateOutcome::Applied { version }
            }
            Err(e) => self.roll_back(e, &backup),
        }
    }

    fn roll_back(&self, cause: UpdateError, backup: &BackupRecord) -> UpdateOutcome {
        error!(error = %cause, "update failed after backup, rolling back");
        match backup.restore() {
            Ok(()) => {
                info!(path = %backup.original_path.display(), "rollback succeeded");
                UpdateOutcome::RolledBack {
                    error: cause.to_string(),
                }
            }
            Err(e) => {
                error!(
                    backup = %backup.backup_path.display(),
                    error = %e,
                    "rollback failed, backup left in place"
                );
                UpdateOutcome::RollbackFailed {
                    error: cause.to_string(),
                    backup: backup.backup_path.clone(),
                }
            }
        }
    }

    fn strategy(&self) -> Arc<dyn SwapStrategy> {
        match (&self.strategy, self.platform) {
            (Some(strategy), _) => Arc::clone(strategy),
            (None, Some(platform)) => swap::strategy_for(platform, Arc::clone(&self.process)),
            (None, None) => Arc::new(swap::InPlaceSwap),
        }
    }

    fn resolve_executable(&self) -> Result<PathBuf, UpdateError> {
        if let Some(path) = &self.executable {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().map_err(|e| UpdateError::ExecutablePath(e.to_string()))?;
        Ok(std::fs::canonicalize(&exe).unwrap_or(exe))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UpdateCheckState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
