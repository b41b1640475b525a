//! Resilient agent loop for the hasheous-taskrunner.
//!
//! - **context**: explicitly owned agent state (config, gates, task flag)
//! - **dispatcher**: the remote job dispatcher seen by the loop
//! - **task_unit**: single-flight task execution on its own tokio task
//! - **daemon**: the tick loop tying registration, heartbeat, updates and tasks together
//! - **environment**: `.env` loading before configuration

pub mod context;
pub mod daemon;
pub mod dispatcher;
pub mod environment;
pub mod task_unit;
