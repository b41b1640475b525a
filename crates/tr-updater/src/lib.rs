//! Self-update subsystem for the hasheous-taskrunner agent.
//!
//! The [`executor::UpdateExecutor`] drives one update attempt end to end:
//! - **locator**: find the newest stable release on the release feed
//! - **platform**: derive the asset name for this OS and architecture
//! - **environment**: skip updates in development checkouts and containers
//! - **download**: fetch the companion checksum and the binary, hashing as it streams
//! - **swap**: replace the live executable (in-place rename or detached helper)
//! - **relaunch**: restart the process with its original arguments

pub mod download;
pub mod environment;
pub mod error;
pub mod executor;
pub mod locator;
pub mod platform;
pub mod relaunch;
pub mod swap;

pub use error::UpdateError;
pub use executor::{UpdateExecutor, UpdateOutcome};
