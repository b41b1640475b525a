//! Reliability infrastructure for the hasheous-taskrunner agent.
//!
//! - **shutdown**: cooperative cancellation shared by the loop and task units
//! - **retry**: exponential backoff for transient failures
//! - **process**: registry of child processes to reap on shutdown

pub mod process;
pub mod retry;
pub mod shutdown;
