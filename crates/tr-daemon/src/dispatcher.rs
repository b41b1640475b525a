use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tr_core::config::DispatcherConfig;
use tr_core::version::Version;
use tr_harness::process::ProcessRegistry;
use tr_harness::shutdown::ShutdownSignal;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header carrying the dispatcher API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

const CLIENTS_PATH: &str = "/api/v1/TaskWorker/clients";
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("dispatcher rejected {operation}: HTTP {status}")]
    Rejected { operation: &'static str, status: u16 },

    #[error("not registered with the dispatcher")]
    NotRegistered,

    #[error("job {id} failed: {reason}")]
    Job { id: String, reason: String },

    /// Work stopped because shutdown was signalled. Not a failure.
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl DispatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The remote job dispatcher as seen by the agent loop.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn is_registered(&self) -> bool;

    async fn register(&self) -> Result<(), DispatchError>;

    /// Refresh the registration. Called periodically by the loop.
    async fn re_register(&self) -> Result<(), DispatchError>;

    async fn send_heartbeat(&self) -> Result<(), DispatchError>;

    async fn unregister(&self) -> Result<(), DispatchError>;

    /// Fetch pending work and run it to completion.
    ///
    /// Must return [`DispatchError::Cancelled`] when `cancel` fires mid-run.
    /// Child processes are spawned through `processes`.
    async fn fetch_and_execute_tasks(
        &self,
        cancel: &ShutdownSignal,
        processes: &ProcessRegistry,
    ) -> Result<(), DispatchError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ClientInfo<'a> {
    client_id: &'a str,
    client_version: String,
    os: &'static str,
    arch: &'static str,
}

/// A unit of work handed out by the dispatcher: a command line to run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JobResult<'a> {
    status: &'a str,
    exit_code: Option<i32>,
}

/// Talks to the dispatcher over its REST API.
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    client_id: String,
    version: Version,
    registered: AtomicBool,
}

impl HttpDispatcher {
    pub fn new(config: &DispatcherConfig, version: Version) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("hasheous-taskrunner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        if config.api_key.is_none() {
            warn!("no dispatcher API key configured; requests will be unauthenticated");
        }
        Ok(Self {
            client,
            base_url: config.host.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client_id: Uuid::new_v4().to_string(),
            version,
            registered: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn clients_url(&self) -> String {
        format!("{}{CLIENTS_PATH}", self.base_url)
    }

    fn client_url(&self, suffix: &str) -> String {
        format!("{}{CLIENTS_PATH}/{}{suffix}", self.base_url, self.client_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    fn client_info(&self) -> ClientInfo<'_> {
        ClientInfo {
            client_id: &self.client_id,
            client_version: self.version.to_string(),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                operation,
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn ensure_registered(&self) -> Result<(), DispatchError> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(DispatchError::NotRegistered)
        }
    }

    async fn fetch_jobs(&self) -> Result<Vec<Job>, DispatchError> {
        let response = self
            .send("fetch jobs", self.client.get(self.client_url("/jobs")))
            .await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body).map_err(|e| DispatchError::Job {
            id: "-".to_string(),
            reason: format!("malformed job list: {e}"),
        })
    }

    async fn run_job(
        &self,
        job: &Job,
        cancel: &ShutdownSignal,
        processes: &ProcessRegistry,
    ) -> Result<(), DispatchError> {
        let failed = |reason: String| DispatchError::Job {
            id: job.id.clone(),
            reason,
        };
        let Some((program, args)) = job.command.split_first() else {
            return Err(failed("empty command".to_string()));
        };

        let mut command = Command::new(program);
        command.args(args);
        let pid = processes
            .spawn(&mut command)
            .await
            .map_err(|e| failed(format!("spawn {program}: {e}")))?;
        info!(job = %job.id, pid, program = %program, "job started");

        let status = loop {
            if cancel.is_shutting_down() {
                return Err(DispatchError::Cancelled);
            }
            match processes.try_status(pid).await {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(_) if cancel.is_shutting_down() => return Err(DispatchError::Cancelled),
                Err(e) => return Err(failed(format!("lost track of pid {pid}: {e}"))),
            }
            tokio::select! {
                _ = tokio::time::sleep(JOB_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            }
        };

        let result = JobResult {
            status: if status.success() { "completed" } else { "failed" },
            exit_code: status.code(),
        };
        self.send(
            "report job",
            self.client
                .post(self.client_url(&format!("/jobs/{}", job.id)))
                .json(&result),
        )
        .await?;
        info!(job = %job.id, status = result.status, exit_code = ?result.exit_code, "job finished");

        if status.success() {
            Ok(())
        } else {
            Err(failed(format!("exited with {status}")))
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    async fn register(&self) -> Result<(), DispatchError> {
        self.send(
            "register",
            self.client.post(self.clients_url()).json(&self.client_info()),
        )
        .await?;
        self.registered.store(true, Ordering::Release);
        info!(client_id = %self.client_id, host = %self.base_url, "registered with dispatcher");
        Ok(())
    }

    async fn re_register(&self) -> Result<(), DispatchError> {
        if !self.is_registered() {
            return self.register().await;
        }
        self.send(
            "re-register",
            self.client
                .put(self.client_url(""))
                .json(&self.client_info()),
        )
        .await?;
        debug!(client_id = %self.client_id, "registration refreshed");
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), DispatchError> {
        self.ensure_registered()?;
        self.send("heartbeat", self.client.post(self.client_url("/heartbeat")))
            .await?;
        debug!("heartbeat sent");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), DispatchError> {
        if !self.is_registered() {
            return Ok(());
        }
        self.send("unregister", self.client.delete(self.client_url("")))
            .await?;
        self.registered.store(false, Ordering::Release);
        info!(client_id = %self.client_id, "unregistered from dispatcher");
        Ok(())
    }

    async fn fetch_and_execute_tasks(
        &self,
        cancel: &ShutdownSignal,
        processes: &ProcessRegistry,
    ) -> Result<(), DispatchError> {
        self.ensure_registered()?;
        let jobs = self.fetch_jobs().await?;
        if jobs.is_empty() {
            debug!("no pending jobs");
            return Ok(());
        }
        info!(count = jobs.len(), "jobs fetched");

        let mut first_error = None;
        for job in &jobs {
            match self.run_job(job, cancel, processes).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(job = %job.id, error = %e, "job failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
