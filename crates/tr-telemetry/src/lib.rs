//! Logging infrastructure for the hasheous-taskrunner agent.
//!
//! - **logging**: human-readable or JSON output via `tracing-subscriber`
//! - **capture**: an in-memory writer for asserting on log output in tests
//!   (`test-util` feature)

#[cfg(any(test, feature = "test-util"))]
pub mod capture;
pub mod logging;
