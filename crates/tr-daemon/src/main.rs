//! hasheous-taskrunner: registers with the dispatcher, runs jobs, and keeps
//! its own binary up to date.

use std::backtrace::Backtrace;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tr_core::config::Config;
use tr_core::version::Version;
use tr_daemon::context::AgentContext;
use tr_daemon::daemon::{emergency_unregister, Daemon};
use tr_daemon::dispatcher::{Dispatcher, HttpDispatcher};
use tr_daemon::environment;
use tr_harness::shutdown::ShutdownSignal;
use tr_updater::UpdateExecutor;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // The configured subscriber needs the config, so start-up logs go to a
    // provisional one.
    let config = tr_telemetry::logging::with_bootstrap_logging(|| {
        environment::load_dotenv();
        Config::load()
    })
    .context("failed to load configuration")?;
    tr_telemetry::logging::init(
        "hasheous-taskrunner",
        &config.general.log_level,
        config.general.json_logs,
    );
    install_panic_hook();

    let version = Version::from_build_metadata(option_env!("CARGO_PKG_VERSION"));
    info!(
        %version,
        pid = std::process::id(),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        host = %config.dispatcher.host,
        "hasheous-taskrunner starting"
    );

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(
        HttpDispatcher::new(&config.dispatcher, version)
            .context("failed to build dispatcher client")?,
    );

    let updater = if config.updates.enabled {
        match UpdateExecutor::builder(&config.updates, version).build() {
            Ok(updater) => Some(updater),
            Err(e) => {
                warn!(error = %e, "self-update unavailable");
                None
            }
        }
    } else {
        info!("self-update disabled by configuration");
        None
    };

    let daemon = Daemon::new(AgentContext::new(config), Arc::clone(&dispatcher), updater);
    spawn_signal_listener(daemon.shutdown_handle());

    match tokio::spawn(daemon.run()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = ?e, "agent stopped with an error");
            emergency_unregister(dispatcher.as_ref()).await;
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "agent loop terminated abnormally");
            emergency_unregister(dispatcher.as_ref()).await;
            Err(anyhow!("agent loop terminated abnormally: {e}"))
        }
    }
}

/// Log every panic with a full backtrace before the default unwinding runs.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        let thread = std::thread::current();
        error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            panic = %info,
            backtrace = %backtrace,
            "unhandled panic"
        );
    }));
}

/// Wire ctrl-c (and SIGTERM on unix) to the shutdown signal.
fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received, initiating shutdown");
        shutdown.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM");
            ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
