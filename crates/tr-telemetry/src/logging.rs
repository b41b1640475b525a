use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

/// Level used before the configured one is known.
const BOOTSTRAP_LEVEL: &str = "info";

/// `RUST_LOG` when set, otherwise the configured level
/// (e.g. "info", "debug", "tr_updater=debug,warn").
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Human-readable logging to stderr.
///
/// Safe to call more than once (e.g. in tests); only the first call installs
/// a subscriber.
pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, format = "text", "logging initialised");
    }
}

/// One JSON object per line, for log shippers.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let installed = fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_current_span(false)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, format = "json", "logging initialised");
    }
}

/// Pick the output format from configuration.
pub fn init(service_name: &str, default_level: &str, json: bool) {
    if json {
        init_logging_json(service_name, default_level);
    } else {
        init_logging(service_name, default_level);
    }
}

/// Run start-up work (environment and config loading) under a provisional
/// stderr logger, so its diagnostics are not dropped before [`init`] runs.
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    with_bootstrap_writer(std::io::stderr, f)
}

/// [`with_bootstrap_logging`] with an explicit writer.
pub fn with_bootstrap_writer<W, T>(writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = fmt()
        .with_env_filter(filter(BOOTSTRAP_LEVEL))
        .with_writer(writer)
        .with_target(true)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}
