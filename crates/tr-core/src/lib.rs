//! Core types shared by the hasheous-taskrunner crates.
//!
//! - **config**: TOML configuration with environment overrides
//! - **version**: four-part release version model with a total order
//! - **release**: release feed records (releases and their assets)
//! - **schedule**: the "is this periodic action due" gate

pub mod config;
pub mod release;
pub mod schedule;
pub mod version;
