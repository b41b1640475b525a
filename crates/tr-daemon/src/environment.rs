use std::ffi::OsString;
use std::path::Path;

use tracing::{debug, info, warn};

/// Points at an environment file to load instead of searching for `.env`.
pub const ENV_FILE_VAR: &str = "HASHEOUS_ENV_FILE";

/// Load `HASHEOUS_ENV_FILE`, or else `.env` from the working directory or a
/// parent, if one exists.
///
/// Must run before [`tr_core::config::Config::load`] so the file can supply
/// `HASHEOUS_*` overrides. Variables already set in the environment win.
pub fn load_dotenv() {
    load_dotenv_from(std::env::var_os(ENV_FILE_VAR));
}

fn load_dotenv_from(explicit: Option<OsString>) {
    if let Some(path) = explicit {
        if let Err(e) = load_env_file(Path::new(&path)) {
            warn!(path = ?path, error = %e, "failed to load environment file");
        }
        return;
    }
    match dotenv::dotenv() {
        Ok(path) => info!(path = %path.display(), "loaded environment file"),
        Err(e) => debug!(error = %e, "no environment file loaded"),
    }
}

/// Load a specific environment file.
pub fn load_env_file(path: &Path) -> Result<(), dotenv::Error> {
    dotenv::from_path(path)?;
    info!(path = %path.display(), "loaded environment file");
    Ok(())
}
