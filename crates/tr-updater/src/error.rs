use std::path::PathBuf;

/// Errors raised inside one update attempt.
///
/// None of these escape [`crate::executor::UpdateExecutor::check_and_apply_update`];
/// they are logged and folded into an [`crate::executor::UpdateOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("release feed returned malformed JSON: {0}")]
    Feed(#[from] serde_json::Error),

    #[error("cannot resolve the running executable: {0}")]
    ExecutablePath(String),

    #[error("swap failed at {path}: {source}")]
    Swap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("relaunch of {path} failed: {source}")]
    Relaunch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
